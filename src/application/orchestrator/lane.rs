//! Per-lane scheduling policy

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::entities::task::Lane;

/// Largest exponent applied by exponential backoff
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(attempt - 1)`
    Exponential { base: Duration },
    Fixed(Duration),
}

impl Backoff {
    /// Delay before the next run, given the number of attempts already made
    pub fn delay(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base } => {
                let exp = attempts.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
                base.saturating_mul(1u32 << exp)
            }
        }
    }

    pub fn chrono_delay(&self, attempts: u32) -> ChronoDuration {
        ChronoDuration::from_std(self.delay(attempts)).unwrap_or_else(|_| ChronoDuration::days(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanePolicy {
    pub priority: i32,
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl LanePolicy {
    pub fn defaults(lane: Lane) -> Self {
        match lane {
            Lane::WebhookProcessing => Self {
                priority: 9,
                concurrency: 4,
                max_retries: 3,
                backoff: Backoff::Exponential {
                    base: Duration::from_secs(60),
                },
            },
            Lane::OrderExecution => Self {
                priority: 10,
                concurrency: 4,
                max_retries: 5,
                backoff: Backoff::Exponential {
                    base: Duration::from_secs(120),
                },
            },
            Lane::HealthChecks => Self {
                priority: 5,
                concurrency: 2,
                max_retries: 2,
                backoff: Backoff::Fixed(Duration::from_secs(300)),
            },
            Lane::Maintenance => Self {
                priority: 1,
                concurrency: 1,
                max_retries: 1,
                backoff: Backoff::Fixed(Duration::from_secs(1800)),
            },
        }
    }

    /// First run plus retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Policies for every lane
#[derive(Debug, Clone, PartialEq)]
pub struct LanePolicies {
    policies: HashMap<Lane, LanePolicy>,
}

impl Default for LanePolicies {
    fn default() -> Self {
        Self {
            policies: Lane::all()
                .into_iter()
                .map(|lane| (lane, LanePolicy::defaults(lane)))
                .collect(),
        }
    }
}

impl LanePolicies {
    pub fn get(&self, lane: Lane) -> LanePolicy {
        self.policies
            .get(&lane)
            .cloned()
            .unwrap_or_else(|| LanePolicy::defaults(lane))
    }

    pub fn set(&mut self, lane: Lane, policy: LanePolicy) {
        self.policies.insert(lane, policy);
    }

    pub fn with(mut self, lane: Lane, policy: LanePolicy) -> Self {
        self.set(lane, policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
        // Attempt zero behaves like the first
        assert_eq!(backoff.delay(0), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(500), Duration::from_secs(1 << MAX_BACKOFF_DOUBLINGS));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_secs(300));
        assert_eq!(backoff.delay(1), backoff.delay(7));
    }

    #[test]
    fn test_lane_defaults() {
        let orders = LanePolicy::defaults(Lane::OrderExecution);
        let webhooks = LanePolicy::defaults(Lane::WebhookProcessing);
        assert!(orders.priority > webhooks.priority);
        assert_eq!(orders.max_attempts(), 6);
        assert_eq!(
            LanePolicy::defaults(Lane::Maintenance).backoff,
            Backoff::Fixed(Duration::from_secs(1800))
        );
    }

    #[test]
    fn test_policies_override() {
        let custom = LanePolicy {
            priority: 1,
            concurrency: 1,
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        };
        let policies = LanePolicies::default().with(Lane::HealthChecks, custom.clone());
        assert_eq!(policies.get(Lane::HealthChecks), custom);
        assert_eq!(policies.get(Lane::Maintenance), LanePolicy::defaults(Lane::Maintenance));
    }
}
