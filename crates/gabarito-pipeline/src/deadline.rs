//! Per-request wall-clock budget.
//!
//! Long-running loops poll [`Deadline::check`]; an overrun surfaces as a
//! request-level [`PipelineError::DeadlineExceeded`]. Each request owns its
//! own deadline, so one slow request never affects another.

use std::time::{Duration, Instant};

use crate::types::PipelineError;

/// A started budget. Unlimited when constructed without a budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Start a budget of `budget_ms` milliseconds now.
    #[must_use]
    pub fn start(budget_ms: Option<u64>) -> Self {
        Self {
            start: Instant::now(),
            budget: budget_ms.map(Duration::from_millis),
        }
    }

    /// A deadline that never expires.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::start(None)
    }

    /// Fail if the budget is used up.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DeadlineExceeded`] naming `stage`.
    pub fn check(&self, stage: &'static str) -> Result<(), PipelineError> {
        match self.budget {
            Some(budget) if self.start.elapsed() >= budget => {
                Err(PipelineError::DeadlineExceeded {
                    stage,
                    budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_expires() {
        assert!(Deadline::unlimited().check("test").is_ok());
    }

    #[test]
    fn zero_budget_expires_immediately() {
        let err = Deadline::start(Some(0)).check("locate");
        assert!(matches!(
            err,
            Err(PipelineError::DeadlineExceeded {
                stage: "locate",
                budget_ms: 0
            })
        ));
    }

    #[test]
    fn generous_budget_does_not_expire() {
        assert!(Deadline::start(Some(60_000)).check("decode").is_ok());
    }
}
