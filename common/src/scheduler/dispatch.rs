// Sharded work dispatch
//
// Work for a given schedule always lands on the same shard, so within one
// process a schedule's notifications are applied in arrival order and never
// concurrently. Different schedules proceed in parallel across shards.

use crate::errors::SchedulerError;
use crate::models::{Notification, ScheduleId};
use crate::scheduler::processor::{ScheduleOutcome, ScheduleProcessor};
use crate::telemetry;
use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives the result of processing one work item
pub type Completion = oneshot::Sender<Result<ScheduleOutcome, SchedulerError>>;

#[derive(Debug)]
pub enum WorkItem {
    Notification {
        schedule: ScheduleId,
        key: String,
        notification: Notification,
        /// Set when the sender waits for the result
        done: Option<Completion>,
    },
    Recheck {
        schedule: ScheduleId,
    },
    /// Acknowledged once everything queued before it on the shard is done
    Flush(oneshot::Sender<()>),
}

pub struct ShardedDispatcher {
    senders: Vec<mpsc::Sender<WorkItem>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    depth: Arc<AtomicI64>,
}

impl ShardedDispatcher {
    /// Spawn `worker_count` shard workers. Must be called inside a Tokio runtime.
    pub fn spawn(processor: Arc<ScheduleProcessor>, worker_count: usize, queue_capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let depth = Arc::new(AtomicI64::new(0));
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for shard in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(run_shard(
                shard,
                rx,
                processor.clone(),
                depth.clone(),
            )));
        }
        info!(worker_count, queue_capacity, "Shard workers started");

        Self {
            senders,
            workers: Mutex::new(workers),
            depth,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn shard_for(&self, schedule: &ScheduleId) -> usize {
        let mut hasher = DefaultHasher::new();
        schedule.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue work for a schedule, waiting for room if its shard is full.
    /// Returns false once the dispatcher has shut down.
    pub async fn submit(&self, item: WorkItem) -> bool {
        let shard = match &item {
            WorkItem::Notification { schedule, .. } | WorkItem::Recheck { schedule } => {
                self.shard_for(schedule)
            }
            WorkItem::Flush(_) => 0,
        };
        self.send(shard, item).await
    }

    async fn send(&self, shard: usize, item: WorkItem) -> bool {
        let queued = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        telemetry::update_queue_depth(queued);
        if self.senders[shard].send(item).await.is_err() {
            let queued = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
            telemetry::update_queue_depth(queued);
            warn!(shard, "Shard worker is gone, dropping work item");
            return false;
        }
        true
    }

    /// Wait until every shard has processed the work queued before this call
    pub async fn flush(&self) {
        let mut pending = Vec::with_capacity(self.senders.len());
        for shard in 0..self.senders.len() {
            let (tx, rx) = oneshot::channel();
            if self.send(shard, WorkItem::Flush(tx)).await {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
    }

    /// Stop accepting work and wait for the queued work to drain
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            return;
        }
        // Workers exit once their queue is empty and every sender is closed.
        // Senders are shared, so closing is done by flushing then aborting.
        self.flush().await;
        for worker in workers.drain(..) {
            worker.abort();
            let _ = worker.await;
        }
        info!("Shard workers stopped");
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    processor: Arc<ScheduleProcessor>,
    depth: Arc<AtomicI64>,
) {
    debug!(shard, "Shard worker running");
    while let Some(item) = rx.recv().await {
        let queued = depth.fetch_sub(1, Ordering::Relaxed) - 1;
        telemetry::update_queue_depth(queued);

        match item {
            WorkItem::Notification {
                schedule,
                key,
                notification,
                done,
            } => {
                let result = guarded(
                    &schedule,
                    processor.process_notification(&schedule, &key, &notification),
                )
                .await;
                match &result {
                    Ok(outcome) => log_outcome(&schedule, outcome),
                    Err(e) => error!(schedule = %schedule, error = %e, "Failed to apply notification"),
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            WorkItem::Recheck { schedule } => {
                match guarded(&schedule, processor.recheck(&schedule)).await {
                    Ok(outcome) => log_outcome(&schedule, &outcome),
                    Err(e) => error!(schedule = %schedule, error = %e, "Failed to re-check schedule"),
                }
            }
            WorkItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(shard, "Shard worker exiting");
}

/// Keep a panic in one schedule's processing from taking the shard down
async fn guarded<F>(schedule: &ScheduleId, work: F) -> Result<ScheduleOutcome, SchedulerError>
where
    F: Future<Output = Result<ScheduleOutcome, SchedulerError>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(schedule = %schedule, "Schedule processing panicked");
            Err(SchedulerError::WorkerPanicked(schedule.to_string()))
        }
    }
}

fn log_outcome(schedule: &ScheduleId, outcome: &ScheduleOutcome) {
    match outcome {
        ScheduleOutcome::Launched(run_id) => {
            debug!(schedule = %schedule, run_id = %run_id, "Work item launched program")
        }
        ScheduleOutcome::LaunchFailed => warn!(schedule = %schedule, "Work item launch failed"),
        other => debug!(schedule = %schedule, outcome = ?other, "Work item processed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedDelay;
    use crate::runtime::ProgramRuntime;
    use crate::store::InMemoryScheduleStore;
    use crate::errors::RuntimeError;
    use crate::models::{LaunchArguments, ProgramId, RunId};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct NoopRuntime;

    #[async_trait::async_trait]
    impl ProgramRuntime for NoopRuntime {
        async fn launch(&self, _: &ProgramId, _: &LaunchArguments) -> Result<RunId, RuntimeError> {
            Ok(RunId::from("run"))
        }

        async fn list_active_runs(&self, _: &ProgramId) -> Result<HashSet<RunId>, RuntimeError> {
            Ok(HashSet::new())
        }
    }

    fn dispatcher(workers: usize) -> ShardedDispatcher {
        let (events, _) = broadcast::channel(16);
        let processor = ScheduleProcessor::new(
            Arc::new(InMemoryScheduleStore::new()),
            Arc::new(NoopRuntime),
            Arc::new(FixedDelay::new(Duration::from_millis(1), 1)),
            events,
            3,
            Duration::from_secs(60),
        );
        ShardedDispatcher::spawn(Arc::new(processor), workers, 8)
    }

    #[tokio::test]
    async fn test_same_schedule_maps_to_same_shard() {
        let dispatcher = dispatcher(4);
        let id = ScheduleId::new("ns", "daily");
        let shard = dispatcher.shard_for(&id);
        for _ in 0..10 {
            assert_eq!(dispatcher.shard_for(&id.clone()), shard);
        }
        assert!(shard < dispatcher.shard_count());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_work() {
        let dispatcher = dispatcher(2);
        for i in 0..5 {
            let submitted = dispatcher
                .submit(WorkItem::Recheck {
                    schedule: ScheduleId::new("ns", format!("s{}", i)),
                })
                .await;
            assert!(submitted);
        }
        tokio::time::timeout(Duration::from_secs(1), dispatcher.flush())
            .await
            .expect("flush should complete");
        assert_eq!(dispatcher.depth.load(Ordering::Relaxed), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let dispatcher = dispatcher(1);
        dispatcher.shutdown().await;
        let submitted = dispatcher
            .submit(WorkItem::Recheck {
                schedule: ScheduleId::new("ns", "late"),
            })
            .await;
        assert!(!submitted);
    }
}
