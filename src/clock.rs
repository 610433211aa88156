use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Mutex;

/// Time source injected into every component that needs wall-clock or
/// day-boundary decisions, so tests can run deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Day used for daily-PnL resets. UTC by design.
    fn today_utc(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replay tooling.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap());
        assert_eq!(clock.today_utc(), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap().date_naive());

        clock.advance(Duration::hours(1));
        assert_eq!(clock.today_utc(), Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap().date_naive());
    }
}
