//! Delivery policies handed to the broker at enqueue time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy: a bounded number of attempts with a fixed delay between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first (>= 1)
    pub max_attempts: u32,
    /// Delay between attempts
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.delay
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Everything the broker needs to know about a message's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub retry: RetryPolicy,
    /// Drop the message from the broker once acknowledged.
    pub remove_on_complete: bool,
    /// Keep exhausted messages around for inspection.
    pub retain_failed: bool,
}

impl Default for DeliveryPolicy {
    /// Three attempts, fixed 5s backoff, completed removed, failures retained.
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            remove_on_complete: true,
            retain_failed: true,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_attempts_fixed_five_seconds() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.retry.max_attempts, 3);
        assert_eq!(policy.retry.delay_after_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.retry.delay_after_attempt(2), Duration::from_secs(5));
        assert!(policy.remove_on_complete);
        assert!(policy.retain_failed);
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn policy_round_trips_through_json_as_millis() {
        let policy = DeliveryPolicy::default();
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["retry"]["delay"], 5000);
        let back: DeliveryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
