use chrono::NaiveDate;
use parking_lot::Mutex;

/// Source of the current calendar day for quota rollover
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock day
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Pinned day, movable from tests
#[derive(Debug)]
pub struct FixedClock {
    day: Mutex<NaiveDate>,
}

impl FixedClock {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day: Mutex::new(day),
        }
    }

    pub fn set(&self, day: NaiveDate) {
        *self.day.lock() = day;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.day.lock()
    }
}
