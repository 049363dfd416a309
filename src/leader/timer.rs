use rand::Rng;
use std::time::Duration;

/// Randomized wait between acquisition attempts, so followers started together
/// do not hit the lock store in lockstep.
pub fn random_acquire_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}
