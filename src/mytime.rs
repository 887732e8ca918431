//! Wall-clock abstraction with a settable alternate "now".
//!
//! Every time read in the daemon goes through [`MyTime`], so tests can pin
//! the clock and exercise ban expiry deterministically. Times are unix
//! seconds as `f64` (log timestamps carry sub-second precision).

use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

static ALTERNATE_NOW: RwLock<Option<f64>> = RwLock::new(None);

/// Clock facade. All methods are process-global.
pub struct MyTime;

impl MyTime {
    /// Current unix time in seconds, or the pinned alternate time.
    pub fn time() -> f64 {
        if let Some(alt) = *ALTERNATE_NOW.read() {
            return alt;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Pin the clock to a fixed value (tests only).
    pub fn set_alternate_now(now: f64) {
        *ALTERNATE_NOW.write() = Some(now);
    }

    /// Unpin the clock.
    pub fn clear_alternate_now() {
        *ALTERNATE_NOW.write() = None;
    }

    /// Format a unix time as `YYYY-MM-DD HH:MM:SS` (UTC).
    pub fn time2str(time: f64) -> String {
        chrono::DateTime::from_timestamp(time as i64, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| format!("{}", time))
    }
}

#[cfg(test)]
static TEST_CLOCK_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Guard that pins the clock for the duration of a test.
///
/// Also serializes clock-pinning tests against each other (the harness runs
/// tests in parallel threads and the clock is process-global).
#[cfg(test)]
pub struct AlternateNowGuard(#[allow(dead_code)] parking_lot::MutexGuard<'static, ()>);

#[cfg(test)]
impl AlternateNowGuard {
    /// Pin the clock; unpins on drop.
    pub fn set(now: f64) -> Self {
        let lock = TEST_CLOCK_LOCK.lock();
        MyTime::set_alternate_now(now);
        AlternateNowGuard(lock)
    }
}

#[cfg(test)]
impl Drop for AlternateNowGuard {
    fn drop(&mut self) {
        MyTime::clear_alternate_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_now() {
        let _guard = AlternateNowGuard::set(1_124_013_600.0);
        assert_eq!(MyTime::time(), 1_124_013_600.0);
    }

    #[test]
    fn test_time2str() {
        assert_eq!(MyTime::time2str(1_124_020_801.0), "2005-08-14 12:00:01");
    }
}
