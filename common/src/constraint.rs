// Launch constraints evaluated after a trigger is satisfied

use crate::errors::ValidationError;
use crate::models::ProgramId;
use crate::runtime::ProgramRuntime;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest accepted launch delay: one year
pub const MAX_DELAY_SECONDS: u64 = 365 * 24 * 60 * 60;

fn default_wait_until_met() -> bool {
    true
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

/// Limit on concurrently active runs of the target program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConstraint {
    pub max_concurrency: u32,
    #[serde(default = "default_wait_until_met")]
    pub wait_until_met: bool,
}

/// Daily launch window in `HH:MM`. A window whose end precedes its start
/// crosses midnight; equal bounds cover the whole day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeConstraint {
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_wait_until_met")]
    pub wait_until_met: bool,
}

/// Minimum time between trigger satisfaction and launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConstraint {
    pub delay_seconds: u64,
    #[serde(default = "default_wait_until_met")]
    pub wait_until_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    Concurrency(ConcurrencyConstraint),
    TimeRange(TimeRangeConstraint),
    Delay(DelayConstraint),
}

/// Outcome of evaluating one or more constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintResult {
    Satisfied,
    /// Hold the satisfied trigger and check again later
    NotSatisfied { retry_after: Option<Duration> },
    /// Give up on this cycle: reset without launching
    Skip,
}

/// What a constraint may look at
pub struct ConstraintContext<'a> {
    pub program: &'a ProgramId,
    pub satisfied_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub runtime: &'a dyn ProgramRuntime,
}

fn parse_time_of_day(field: &str, value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| ValidationError::InvalidFieldValue {
        field: field.to_string(),
        reason: format!("'{}' is not HH:MM: {}", value, e),
    })
}

fn to_std(duration: chrono::Duration) -> Option<Duration> {
    duration.to_std().ok()
}

impl Constraint {
    pub fn concurrency(max_concurrency: u32) -> Self {
        Constraint::Concurrency(ConcurrencyConstraint {
            max_concurrency,
            wait_until_met: true,
        })
    }

    pub fn time_range(start_time: &str, end_time: &str, timezone: Tz) -> Self {
        Constraint::TimeRange(TimeRangeConstraint {
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            timezone,
            wait_until_met: true,
        })
    }

    pub fn delay(delay_seconds: u64) -> Self {
        Constraint::Delay(DelayConstraint {
            delay_seconds,
            wait_until_met: true,
        })
    }

    /// Turn "not yet" into "skip this cycle"
    pub fn skip_if_not_met(mut self) -> Self {
        match &mut self {
            Constraint::Concurrency(c) => c.wait_until_met = false,
            Constraint::TimeRange(c) => c.wait_until_met = false,
            Constraint::Delay(c) => c.wait_until_met = false,
        }
        self
    }

    pub fn constraint_type(&self) -> &'static str {
        match self {
            Constraint::Concurrency(_) => "concurrency",
            Constraint::TimeRange(_) => "time_range",
            Constraint::Delay(_) => "delay",
        }
    }

    pub fn wait_until_met(&self) -> bool {
        match self {
            Constraint::Concurrency(c) => c.wait_until_met,
            Constraint::TimeRange(c) => c.wait_until_met,
            Constraint::Delay(c) => c.wait_until_met,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Constraint::Concurrency(c) if c.max_concurrency < 1 => {
                Err(ValidationError::InvalidFieldValue {
                    field: "max_concurrency".to_string(),
                    reason: "must be at least 1".to_string(),
                })
            }
            Constraint::TimeRange(c) => {
                parse_time_of_day("start_time", &c.start_time)?;
                parse_time_of_day("end_time", &c.end_time)?;
                Ok(())
            }
            Constraint::Delay(c) if c.delay_seconds > MAX_DELAY_SECONDS => {
                Err(ValidationError::InvalidFieldValue {
                    field: "delay_seconds".to_string(),
                    reason: format!("must be at most {}", MAX_DELAY_SECONDS),
                })
            }
            _ => Ok(()),
        }
    }

    /// Evaluate this constraint, applying `wait_until_met`.
    ///
    /// A runtime failure is treated as "not yet satisfied".
    pub async fn check(&self, ctx: &ConstraintContext<'_>) -> ConstraintResult {
        let result = match self {
            Constraint::Concurrency(c) => check_concurrency(c, ctx).await,
            Constraint::TimeRange(c) => check_time_range(c, ctx),
            Constraint::Delay(c) => check_delay(c, ctx),
        };

        match result {
            ConstraintResult::NotSatisfied { .. } if !self.wait_until_met() => ConstraintResult::Skip,
            other => other,
        }
    }
}

async fn check_concurrency(
    constraint: &ConcurrencyConstraint,
    ctx: &ConstraintContext<'_>,
) -> ConstraintResult {
    match ctx.runtime.list_active_runs(ctx.program).await {
        Ok(runs) if runs.len() < constraint.max_concurrency as usize => ConstraintResult::Satisfied,
        Ok(runs) => {
            debug!(
                program = %ctx.program,
                active_runs = runs.len(),
                max_concurrency = constraint.max_concurrency,
                "Concurrency limit reached"
            );
            ConstraintResult::NotSatisfied { retry_after: None }
        }
        Err(e) => {
            warn!(program = %ctx.program, error = %e, "Failed to list active runs");
            ConstraintResult::NotSatisfied { retry_after: None }
        }
    }
}

fn check_time_range(constraint: &TimeRangeConstraint, ctx: &ConstraintContext<'_>) -> ConstraintResult {
    let (start, end) = match (
        parse_time_of_day("start_time", &constraint.start_time),
        parse_time_of_day("end_time", &constraint.end_time),
    ) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Invalid time range constraint");
            return ConstraintResult::NotSatisfied { retry_after: None };
        }
    };

    let local_now = ctx.now.with_timezone(&constraint.timezone);
    let now = local_now.time();
    let inside = if start == end {
        true
    } else if start < end {
        start <= now && now < end
    } else {
        now >= start || now < end
    };

    if inside {
        return ConstraintResult::Satisfied;
    }

    // Wall-clock distance to the next window start
    let mut until_start = start.signed_duration_since(now);
    if until_start < chrono::Duration::zero() {
        until_start = until_start + chrono::Duration::days(1);
    }
    ConstraintResult::NotSatisfied {
        retry_after: to_std(until_start),
    }
}

fn check_delay(constraint: &DelayConstraint, ctx: &ConstraintContext<'_>) -> ConstraintResult {
    let satisfied_at = ctx.satisfied_at.unwrap_or(ctx.now);
    let ready_at = i64::try_from(constraint.delay_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| satisfied_at.checked_add_signed(delay));
    let Some(ready_at) = ready_at else {
        warn!(
            delay_seconds = constraint.delay_seconds,
            "Delay constraint is out of range"
        );
        return ConstraintResult::NotSatisfied { retry_after: None };
    };
    if ctx.now >= ready_at {
        ConstraintResult::Satisfied
    } else {
        ConstraintResult::NotSatisfied {
            retry_after: to_std(ready_at - ctx.now),
        }
    }
}

/// Evaluate every constraint of a schedule.
///
/// Skip dominates, then NotSatisfied (with the soonest known retry), then
/// Satisfied.
pub async fn evaluate_constraints(
    constraints: &[Constraint],
    ctx: &ConstraintContext<'_>,
) -> ConstraintResult {
    let mut held = false;
    let mut retry_after: Option<Duration> = None;

    for constraint in constraints {
        match constraint.check(ctx).await {
            ConstraintResult::Satisfied => {}
            ConstraintResult::Skip => {
                debug!(constraint = constraint.constraint_type(), "Constraint skips cycle");
                return ConstraintResult::Skip;
            }
            ConstraintResult::NotSatisfied { retry_after: after } => {
                debug!(constraint = constraint.constraint_type(), "Constraint not yet met");
                held = true;
                retry_after = match (retry_after, after) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
    }

    if held {
        ConstraintResult::NotSatisfied { retry_after }
    } else {
        ConstraintResult::Satisfied
    }
}
