/*!
 # Wall clock

 The schedule runs on local wall time: UTC plus a fixed offset, plus one
 hour while daylight saving is active.
*/

use chrono::{DateTime, Datelike, NaiveDateTime, Utc, Weekday};
use tracing::{debug, trace};

/// Source of local wall time
pub trait Clock {
    /// Current local wall time
    fn now(&self) -> NaiveDateTime;

    /// Sets the total offset from UTC in seconds, applied from the next sync
    fn set_offset(&mut self, offset_secs: i64);

    /// Re-synchronizes the clock, returning whether it succeeded
    fn sync(&mut self) -> bool;

    /// Day of the week in local wall time
    fn weekday(&self) -> Weekday {
        self.now().weekday()
    }
}

/// Clock backed by the host's system time
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset_secs: i64,
    pending_offset: Option<i64>,
    last_sync: Option<DateTime<Utc>>,
}

impl SystemClock {
    pub fn new(offset_secs: i64) -> Self {
        Self {
            offset_secs,
            pending_offset: None,
            last_sync: None,
        }
    }

    pub fn offset_secs(&self) -> i64 {
        self.offset_secs
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        (Utc::now() + chrono::Duration::seconds(self.offset_secs)).naive_utc()
    }

    fn set_offset(&mut self, offset_secs: i64) {
        if offset_secs != self.offset_secs {
            debug!("Clock offset change requested: {}s -> {}s", self.offset_secs, offset_secs);
            self.pending_offset = Some(offset_secs);
        }
    }

    /// The host clock is disciplined by the operating system; syncing only
    /// applies a pending offset change.
    fn sync(&mut self) -> bool {
        if let Some(offset) = self.pending_offset.take() {
            self.offset_secs = offset;
            debug!("Clock offset now {}s", offset);
        }
        let now = Utc::now();
        trace!("Clock synced at {}", now);
        self.last_sync = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_applies_on_sync() {
        let mut clock = SystemClock::new(3600);
        clock.set_offset(7200);
        assert_eq!(clock.offset_secs(), 3600);
        assert!(clock.sync());
        assert_eq!(clock.offset_secs(), 7200);
        assert!(clock.last_sync().is_some());
    }

    #[test]
    fn test_now_includes_offset() {
        let clock = SystemClock::new(3600);
        let utc = Utc::now().timestamp();
        let local = clock.now().and_utc().timestamp();
        assert!((local - utc - 3600).abs() <= 2);
    }
}
