// libs/telemedicine-cell/src/services/lifecycle.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::error::TelemedicineError;
use crate::models::{Consultation, ConsultationStatus};

/// Commands accepted by the consultation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    JoinWaiting,
    Start,
    End,
    Cancel,
    Fail,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionKind::JoinWaiting => "join",
            TransitionKind::Start => "start",
            TransitionKind::End => "end",
            TransitionKind::Cancel => "cancel",
            TransitionKind::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// Resolution of a command against the current status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStep {
    Move(ConsultationStatus),
    /// Accepted, nothing changes (repeated join, start while in progress)
    NoOp,
}

/// Pure transition table of the consultation lifecycle:
///
/// ```text
/// scheduled --join--> waiting --start--> in_progress --end--> ended
///     |                  |  \--end------------------------------^
///     +--cancel----------+--cancel--> cancelled
/// any non-terminal --fail--> failed
/// ```
pub struct ConsultationLifecycle;

impl ConsultationLifecycle {
    pub fn resolve(
        current: ConsultationStatus,
        kind: TransitionKind,
    ) -> Result<TransitionStep, TelemedicineError> {
        use ConsultationStatus::*;

        let step = match (kind, current) {
            (TransitionKind::JoinWaiting, Scheduled) => Some(TransitionStep::Move(Waiting)),
            (TransitionKind::JoinWaiting, Waiting | InProgress) => Some(TransitionStep::NoOp),

            (TransitionKind::Start, Waiting) => Some(TransitionStep::Move(InProgress)),
            (TransitionKind::Start, InProgress) => Some(TransitionStep::NoOp),

            (TransitionKind::End, Waiting | InProgress) => Some(TransitionStep::Move(Ended)),

            (TransitionKind::Cancel, Scheduled | Waiting) => Some(TransitionStep::Move(Cancelled)),

            (TransitionKind::Fail, status) if !status.is_terminal() => Some(TransitionStep::Move(Failed)),

            _ => None,
        };

        step.ok_or_else(|| {
            warn!("Invalid consultation transition attempted: {} while {}", kind, current);
            TelemedicineError::InvalidTransition {
                attempted: kind,
                current,
            }
        })
    }

    /// Apply a command to a consultation record, maintaining its timestamps.
    /// Returns the step taken; the record is untouched on `NoOp` or error.
    ///
    /// `occurred_at` is when the change happened (a provider's event time for
    /// webhooks, `now` otherwise). Start, end and termination times use it,
    /// capped at `now`; `updated_at` is always `now`.
    pub fn apply(
        consultation: &mut Consultation,
        kind: TransitionKind,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TransitionStep, TelemedicineError> {
        let step = Self::resolve(consultation.status, kind)?;
        let at = occurred_at.min(now);

        let target = match step {
            TransitionStep::NoOp => {
                debug!(
                    "Consultation {}: {} while {} is a no-op",
                    consultation.id, kind, consultation.status
                );
                return Ok(step);
            }
            TransitionStep::Move(target) => target,
        };

        match target {
            ConsultationStatus::InProgress => {
                consultation.actual_start_time.get_or_insert(at);
            }
            ConsultationStatus::Ended => {
                // end never precedes start, even with skewed provider clocks
                let end = match consultation.actual_start_time {
                    Some(start) if start > at => start,
                    _ => at,
                };
                consultation.actual_end_time = Some(end);
            }
            _ => {}
        }

        if target.is_terminal() {
            consultation.terminated_at = Some(at);
        }
        if reason.is_some() {
            consultation.status_reason = reason;
        }

        debug!(
            "Consultation {}: {} -> {} ({})",
            consultation.id, consultation.status, target, kind
        );
        consultation.status = target;
        consultation.updated_at = now;

        Ok(step)
    }
}
