use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// The delay grows as `base * factor^(attempt-1)` capped at `cap`, and the
/// actual sleep is drawn uniformly from `[0, delay]` so a fleet of agents
/// retrying against a recovering bus does not arrive in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "default_base_ms")]
  pub base_ms: u64,
  #[serde(default = "default_factor")]
  pub factor: f64,
  #[serde(default = "default_cap_ms")]
  pub cap_ms: u64,
}

fn default_base_ms() -> u64 {
  500
}
fn default_factor() -> f64 {
  2.0
}
fn default_cap_ms() -> u64 {
  60_000
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_ms: default_base_ms(),
      factor: default_factor(),
      cap_ms: default_cap_ms(),
    }
  }
}

impl RetryPolicy {
  /// Upper bound of the backoff window for the given attempt (1-based).
  pub fn delay_ceiling(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = (self.base_ms as f64 * self.factor.powi(exponent as i32)) as u64;
    Duration::from_millis(delay_ms.min(self.cap_ms))
  }

  /// Jittered delay for the given attempt (1-based).
  pub fn next_delay(&self, attempt: u32) -> Duration {
    let ceiling = self.delay_ceiling(attempt).as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ceiling_grows_exponentially_until_the_cap() {
    let policy = RetryPolicy {
      base_ms: 500,
      factor: 2.0,
      cap_ms: 60_000,
    };

    assert_eq!(policy.delay_ceiling(1), Duration::from_millis(500));
    assert_eq!(policy.delay_ceiling(2), Duration::from_millis(1_000));
    assert_eq!(policy.delay_ceiling(3), Duration::from_millis(2_000));
    assert_eq!(policy.delay_ceiling(8), Duration::from_millis(60_000));
    assert_eq!(policy.delay_ceiling(30), Duration::from_millis(60_000));
  }

  #[test]
  fn jittered_delay_stays_inside_the_window() {
    let policy = RetryPolicy::default();
    for attempt in 1..=10 {
      let ceiling = policy.delay_ceiling(attempt);
      for _ in 0..32 {
        assert!(policy.next_delay(attempt) <= ceiling);
      }
    }
  }

  #[test]
  fn huge_attempt_counts_do_not_overflow() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_ceiling(u32::MAX), Duration::from_millis(60_000));
  }
}
