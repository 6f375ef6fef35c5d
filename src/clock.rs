// =============================================================================
// Clock & Timer Service — monotonic wall-clock plus named, cancellable
// one-shot and periodic alerts.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// A named, cancellable timer handle. Dropping the guard does not cancel the
/// timer — use [`Clock::cancel`] explicitly, matching the spec's
/// `cancel(name)` contract (re-registering a name silently replaces the
/// prior entry rather than erroring).
struct TimerHandle {
    cancel: Arc<Notify>,
}

/// UTC wall-clock with named alert/periodic registration. Accuracy target
/// (live mode): alerts fire within 50ms of their target; this holds as long
/// as the tokio runtime isn't starved, which is the same guarantee every
/// `tokio::time::sleep` caller gets.
pub struct Clock {
    timers: Mutex<HashMap<String, TimerHandle>>,
}

impl Clock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Register a one-shot alert firing at `at`. Re-registering `name`
    /// cancels and replaces the previous entry under that name.
    pub fn set_alert<F, Fut>(self: &Arc<Self>, name: impl Into<String>, at: DateTime<Utc>, cb: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.register(name.clone());
        let clock = self.clone();
        tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    trace!(timer = %name, "alert fired");
                    cb().await;
                    clock.clear_if_current(&name, &cancel);
                }
                _ = cancel.notified() => {
                    debug!(timer = %name, "alert cancelled before firing");
                }
            }
        });
    }

    /// Register a periodic alert firing every `interval` until cancelled.
    pub fn set_periodic<F, Fut>(self: &Arc<Self>, name: impl Into<String>, interval: Duration, cb: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.register(name.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cb().await;
                    }
                    _ = cancel.notified() => {
                        debug!(timer = %name, "periodic cancelled");
                        break;
                    }
                }
            }
        });
    }

    /// Cancel a named timer. Idempotent: cancelling an unknown or
    /// already-fired name is a no-op.
    pub fn cancel(&self, name: &str) {
        if let Some(handle) = self.timers.lock().remove(name) {
            handle.cancel.notify_waiters();
        }
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.timers.lock().contains_key(name)
    }

    fn register(&self, name: String) -> Arc<Notify> {
        let cancel = Arc::new(Notify::new());
        let mut timers = self.timers.lock();
        if let Some(prev) = timers.insert(name, TimerHandle { cancel: cancel.clone() }) {
            prev.cancel.notify_waiters();
        }
        cancel
    }

    /// Remove the timer entry only if it's still the one we armed (a
    /// `cancel` + immediate re-`set_alert` under the same name must not
    /// let the stale completion clobber the new entry).
    fn clear_if_current(&self, name: &str, cancel: &Arc<Notify>) {
        let mut timers = self.timers.lock();
        if let Some(handle) = timers.get(name) {
            if Arc::ptr_eq(&handle.cancel, cancel) {
                timers.remove(name);
            }
        }
    }
}

/// Exchange-local time helpers. The clock itself only deals in UTC instants;
/// callers convert at the boundary, per §4.1.
pub mod tz {
    use chrono::{DateTime, NaiveTime, TimeZone, Utc};
    use chrono_tz::Tz;

    pub const EASTERN: Tz = chrono_tz::America::New_York;

    /// True if `instant` falls on or after `time_of_day` in `zone`.
    pub fn past_time_of_day(instant: DateTime<Utc>, zone: Tz, time_of_day: NaiveTime) -> bool {
        instant.with_timezone(&zone).time() >= time_of_day
    }

    /// The calendar date of `instant` in `zone`, used for daily-reset
    /// comparisons.
    pub fn local_date(instant: DateTime<Utc>, zone: Tz) -> chrono::NaiveDate {
        instant.with_timezone(&zone).date_naive()
    }

    pub fn today_at(instant: DateTime<Utc>, zone: Tz, time_of_day: NaiveTime) -> DateTime<Utc> {
        let local_date = local_date(instant, zone);
        zone.from_local_datetime(&local_date.and_time(time_of_day))
            .single()
            .unwrap_or_else(|| instant.with_timezone(&zone))
            .with_timezone(&Utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn alert_fires_once() {
        let clock = Clock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        clock.set_alert("test", Utc::now() + chrono::Duration::milliseconds(20), move || {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!clock.is_armed("test"));
    }

    #[tokio::test]
    async fn cancel_before_fire_suppresses_callback() {
        let clock = Clock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        clock.set_alert("test", Utc::now() + chrono::Duration::milliseconds(200), move || {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        clock.cancel("test");
        tokio::time::sleep(StdDuration::from_millis(260)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reregistering_replaces_prior_entry() {
        let clock = Clock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        clock.set_alert("test", Utc::now() + chrono::Duration::milliseconds(200), move || {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        let c3 = count.clone();
        clock.set_alert("test", Utc::now() + chrono::Duration::milliseconds(20), move || {
            let c = c3.clone();
            async move {
                c.fetch_add(10, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(StdDuration::from_millis(260)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn periodic_runs_until_cancelled() {
        let clock = Clock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        clock.set_periodic("tick", StdDuration::from_millis(15), move || {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(StdDuration::from_millis(70)).await;
        clock.cancel("tick");
        let observed = count.load(Ordering::SeqCst);
        assert!(observed >= 3);
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), observed);
    }
}
