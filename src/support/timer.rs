//! Owned timer handles
//!
//! Every periodic job in the station (heartbeat, OCSP refresh, certificate
//! expiry checks, clock-aligned meter samples) is modelled as a handle that
//! aborts its task on drop, so a timer can never outlive the component that
//! scheduled it.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::task::JoinHandle;

/// A one-shot timer. The callback runs once after `delay` unless the handle
/// is dropped or [`OwnedTimer::cancel`] is called first.
pub struct OwnedTimer {
    handle: JoinHandle<()>,
}

impl OwnedTimer {
    pub fn once<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });
        Self { handle }
    }

    /// One-shot timer firing at an absolute instant. Fires immediately when
    /// `at` is already in the past.
    pub fn at<F, Fut>(at: DateTime<Utc>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        Self::once(delay, callback)
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for OwnedTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A repeating timer. The callback runs every `interval` until the handle is
/// dropped.
pub struct RepeatingTimer {
    handle: JoinHandle<()>,
}

impl RepeatingTimer {
    pub fn every<F, Fut>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick of tokio's interval completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback().await;
            }
        });
        Self { handle }
    }

    /// A repeating timer whose ticks are aligned to wall-clock multiples of
    /// `interval` past midnight UTC (OCPP clock-aligned meter data). An
    /// interval of 900s fires at :00, :15, :30, :45.
    pub fn clock_aligned<F, Fut>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            loop {
                let delay = duration_to_next_aligned_tick(Utc::now(), interval);
                tokio::time::sleep(delay).await;
                callback().await;
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn duration_to_next_aligned_tick(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_s = interval.as_secs().max(1);
    let since_midnight = u64::from(now.num_seconds_from_midnight());
    let elapsed_in_slot = since_midnight % interval_s;
    Duration::from_secs(interval_s - elapsed_in_slot)
}
