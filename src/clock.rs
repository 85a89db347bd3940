use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Injectable time source. The syncer and briefcase never read wall-clock
/// time directly; everything that needs "now" takes a clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}


#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::fake::FakeClock;
    use super::Clock;

    #[test]
    fn fake_clock_only_moves_when_advanced() {
        let start = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let clock = FakeClock::at(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
