use std::sync::Mutex;

use settld_core::IsoMillis;

/// Injected time source. The settlement kernel and the maintenance loop never
/// read the wall clock directly, so tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> IsoMillis;
}

/// Wall clock, truncated to millisecond precision.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> IsoMillis {
        IsoMillis::from_datetime(chrono::Utc::now())
    }
}

/// Hand-driven clock for tests.
pub struct ManualClock {
    now: Mutex<IsoMillis>,
}

impl ManualClock {
    pub fn new(start: IsoMillis) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: IsoMillis) {
        *self.now.lock().expect("clock mutex") = now;
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut guard = self.now.lock().expect("clock mutex");
        *guard = IsoMillis(guard.0 + chrono::Duration::milliseconds(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> IsoMillis {
        *self.now.lock().expect("clock mutex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new(IsoMillis::parse("2026-08-01T00:00:00.000Z").unwrap());
        clock.advance_ms(1500);
        assert_eq!(
            clock.now().as_rfc3339_millis(),
            "2026-08-01T00:00:01.500Z"
        );
    }
}
