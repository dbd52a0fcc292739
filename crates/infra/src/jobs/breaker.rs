//! Per-stage circuit breaker for the continuous worker.
//!
//! State is process-local and lost on restart; it only keeps *this* worker
//! from claiming a stage that keeps failing. Other workers are unaffected.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use fulfillment_core::Stage;

use super::types::to_chrono;

/// When a failure opens a stage's breaker and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// A failure whose job has reached this many attempts opens the breaker
    pub threshold: u32,
    /// How long the breaker stays open; also the elevated retry delay
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerPolicy {
    pub fn trips(&self, attempts: u32) -> bool {
        attempts >= self.threshold
    }
}

/// Map of stage → "open until".
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    cooldown: Duration,
    open_until: HashMap<Stage, DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            open_until: HashMap::new(),
        }
    }

    /// Open (or re-open) the breaker for `stage` until `now + cooldown`.
    pub fn trip(&mut self, stage: Stage, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + to_chrono(self.cooldown);
        self.open_until.insert(stage, until);
        info!(stage = %stage, open_until = %until, "stage breaker opened");
        until
    }

    pub fn is_open(&self, stage: Stage, now: DateTime<Utc>) -> bool {
        self.open_until.get(&stage).is_some_and(|until| *until > now)
    }

    /// Stages to exclude from the next claim. Elapsed entries are pruned.
    pub fn excluded(&mut self, now: DateTime<Utc>) -> Vec<Stage> {
        self.open_until.retain(|stage, until| {
            let open = *until > now;
            if !open {
                info!(stage = %stage, "stage breaker closed");
            }
            open
        });

        let mut stages: Vec<Stage> = self.open_until.keys().copied().collect();
        stages.sort();
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_trips_at_threshold() {
        let policy = BreakerPolicy::default();
        assert!(!policy.trips(2));
        assert!(policy.trips(3));
        assert!(policy.trips(4));
    }

    #[test]
    fn open_stage_is_excluded_until_cooldown_elapses() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60));
        let now = Utc::now();

        breaker.trip(Stage::Booking, now);

        assert_eq!(breaker.excluded(now), vec![Stage::Booking]);
        assert_eq!(
            breaker.excluded(now + chrono::Duration::seconds(59)),
            vec![Stage::Booking]
        );
        assert!(breaker.excluded(now + chrono::Duration::seconds(60)).is_empty());
        assert!(!breaker.is_open(Stage::Booking, now));
    }

    #[test]
    fn stages_are_independent() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(10));
        let now = Utc::now();

        breaker.trip(Stage::Payment, now);
        breaker.trip(Stage::Ingest, now + chrono::Duration::seconds(5));

        let later = now + chrono::Duration::seconds(12);
        assert_eq!(breaker.excluded(later), vec![Stage::Ingest]);
        assert!(!breaker.is_open(Stage::Payment, later));
        assert!(breaker.is_open(Stage::Ingest, later));
    }

    #[test]
    fn retrip_extends_the_window() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(10));
        let now = Utc::now();

        breaker.trip(Stage::Ingest, now);
        let until = breaker.trip(Stage::Ingest, now + chrono::Duration::seconds(8));

        assert_eq!(until, now + chrono::Duration::seconds(18));
        assert!(breaker.is_open(Stage::Ingest, now + chrono::Duration::seconds(15)));
    }
}
