// =============================================================================
// Opening-Range Engine (C8.4.8.1) — shared daily high/low tracking used by
// every range-breakout strategy.
// =============================================================================
//
// Daily extrema start as `None` rather than the sentinel the source used
// (a literal 1_000_000.0 for "not yet set"), so "no observation yet" and
// "observed a value of zero" are never confused.

use parking_lot::RwLock;

use crate::clock::tz;

pub struct RangeEngine {
    range_open: chrono::NaiveTime,
    range_close: chrono::NaiveTime,
    zone: chrono_tz::Tz,

    daily_high: RwLock<Option<f64>>,
    daily_low: RwLock<Option<f64>>,
    range_locked: RwLock<bool>,
    range_date: RwLock<Option<chrono::NaiveDate>>,
}

impl RangeEngine {
    pub fn new(range_open: chrono::NaiveTime, range_close: chrono::NaiveTime) -> Self {
        Self {
            range_open,
            range_close,
            zone: tz::EASTERN,
            daily_high: RwLock::new(None),
            daily_low: RwLock::new(None),
            range_locked: RwLock::new(false),
            range_date: RwLock::new(None),
        }
    }

    /// Resets the range for a new trading day. Idempotent within the same
    /// calendar date.
    pub fn roll_day(&self, now: chrono::DateTime<chrono::Utc>) {
        let today = tz::local_date(now, self.zone);
        let mut range_date = self.range_date.write();
        if *range_date == Some(today) {
            return;
        }
        *range_date = Some(today);
        *self.daily_high.write() = None;
        *self.daily_low.write() = None;
        *self.range_locked.write() = false;
    }

    /// Feeds a price observation into the range while the window is open.
    /// No-op once the range has locked for the day.
    pub fn observe(&self, now: chrono::DateTime<chrono::Utc>, price: f64) {
        if *self.range_locked.read() {
            return;
        }
        let local_time = now.with_timezone(&self.zone).time();
        if local_time < self.range_open {
            return;
        }
        if local_time >= self.range_close {
            *self.range_locked.write() = true;
            return;
        }
        let mut high = self.daily_high.write();
        *high = Some(high.map_or(price, |h| h.max(price)));
        let mut low = self.daily_low.write();
        *low = Some(low.map_or(price, |l| l.min(price)));
    }

    pub fn high(&self) -> Option<f64> {
        *self.daily_high.read()
    }

    pub fn low(&self) -> Option<f64> {
        *self.daily_low.read()
    }

    pub fn is_locked(&self) -> bool {
        *self.range_locked.read()
    }

    pub fn width(&self) -> Option<f64> {
        match (self.high(), self.low()) {
            (Some(h), Some(l)) => Some(h - l),
            _ => None,
        }
    }
}
