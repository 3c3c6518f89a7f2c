// Scheduler: notification routing, trigger evaluation and program launch

pub mod admin;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod processor;
pub mod time_events;

pub use admin::ProgramDeletionSummary;
pub use dispatch::{ShardedDispatcher, WorkItem};
pub use engine::{Scheduler, SchedulerConfig, SchedulerService, TickSummary};
pub use events::ScheduleEvent;
pub use processor::{build_launch_arguments, ScheduleOutcome, ScheduleProcessor};
pub use time_events::TimeEventGenerator;
