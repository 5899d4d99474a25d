//! Reconnect backoff policy for source supervisors.
//!
//! Exponential growth with a hard cap, ±jitter to avoid synchronized
//! reconnect storms across sources, and a reset once a connection has
//! proven itself stable.

use rand::Rng;
use std::time::Duration;

/// Hard ceiling on any computed reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Static parameters of the reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First delay after a failure.
    pub initial_delay: Duration,
    /// Ceiling for the growing delay.
    pub max_delay: Duration,
    /// Growth factor applied after every failed cycle.
    pub multiplier: f64,
    /// Uniform jitter fraction applied to each delay (0.1 = ±10%).
    pub jitter: f64,
    /// A run at least this long resets the delay back to `initial_delay`.
    pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        let initial_delay = Duration::from_secs(1);
        Self {
            initial_delay,
            max_delay: MAX_RECONNECT_DELAY,
            multiplier: 2.0,
            jitter: 0.1,
            // Stable means the connection outlived two initial backoffs.
            reset_after: initial_delay * 2,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.min(MAX_RECONNECT_DELAY),
            reset_after: initial_delay * 2,
            ..Self::default()
        }
    }
}

/// Mutable backoff state owned by one supervisor.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.initial_delay;
        Self { policy, current }
    }

    /// The delay to sleep before the next attempt, advancing the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.policy.multiplier;
        self.current = Duration::from_secs_f64(grown).min(self.policy.max_delay);
        delay
    }

    /// Record how long the last run survived; a stable run resets the ramp.
    pub fn note_run(&mut self, run_duration: Duration) {
        if run_duration >= self.policy.reset_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
    }

    /// Apply the policy's uniform ±jitter to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        jittered(delay, self.policy.jitter, &mut rand::rng())
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

/// Uniform ±`fraction` jitter around `delay`, with an explicit RNG so tests
/// can be deterministic.
pub fn jittered<R: Rng>(delay: Duration, fraction: f64, rng: &mut R) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let base = delay.as_secs_f64();
    let factor = rng.random_range((1.0 - fraction)..=(1.0 + fraction));
    Duration::from_secs_f64((base * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy_ms(initial: u64, max: u64) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(initial), Duration::from_millis(max))
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = ReconnectBackoff::new(policy_ms(100, 1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn stable_run_resets_the_ramp() {
        let mut backoff = ReconnectBackoff::new(policy_ms(100, 10_000));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        // Outlived 2 × initial: reset.
        backoff.note_run(Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn short_run_keeps_the_ramp() {
        let mut backoff = ReconnectBackoff::new(policy_ms(100, 10_000));
        let _ = backoff.next_delay();
        backoff.note_run(Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_the_band() {
        let mut rng = StdRng::seed_from_u64(7);
        let nominal = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(nominal, 0.1, &mut rng);
            assert!(d >= Duration::from_millis(900), "{d:?}");
            assert!(d <= Duration::from_millis(1100), "{d:?}");
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let nominal = Duration::from_millis(1234);
        assert_eq!(jittered(nominal, 0.0, &mut rng), nominal);
    }

    #[test]
    fn policy_cap_never_exceeds_global_ceiling() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(100_000));
        assert_eq!(policy.max_delay, MAX_RECONNECT_DELAY);
    }
}
