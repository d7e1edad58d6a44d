use std::time::Duration;

use rand::Rng;

use crate::options::{Jitter, ReconnectOptions};

/// Delay before reconnect attempt `attempt` (0-based):
/// `min(max_delay, initial_delay × 2^attempt)`, optionally jittered over
/// `[0, delay]`.
pub(crate) fn reconnect_delay(attempt: u32, options: &ReconnectOptions) -> Duration {
    let exponential = options
        .initial_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(31)));
    let capped = exponential.min(options.max_delay);
    match options.jitter {
        Jitter::None => capped,
        Jitter::Full => {
            let ceiling = capped.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..=ceiling))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(jitter: Jitter) -> ReconnectOptions {
        ReconnectOptions {
            jitter,
            ..ReconnectOptions::default()
        }
    }

    #[test]
    fn doubles_until_the_cap() {
        let options = options(Jitter::None);
        assert_eq!(reconnect_delay(0, &options), Duration::from_millis(300));
        assert_eq!(reconnect_delay(1, &options), Duration::from_millis(600));
        assert_eq!(reconnect_delay(2, &options), Duration::from_millis(1200));
        assert_eq!(reconnect_delay(10, &options), Duration::from_secs(10));
        assert_eq!(reconnect_delay(31, &options), Duration::from_secs(10));
    }

    #[test]
    fn full_jitter_stays_within_the_envelope() {
        let jittered = options(Jitter::Full);
        let flat = options(Jitter::None);
        for attempt in 0..8 {
            let ceiling = reconnect_delay(attempt, &flat);
            for _ in 0..32 {
                assert!(reconnect_delay(attempt, &jittered) <= ceiling);
            }
        }
    }
}
