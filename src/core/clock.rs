//! Server-synchronized clock.
//!
//! All cross-client timing (countdown arm time, punishment expiry) is expressed
//! as seconds since the Unix epoch on the *server's* clock. A `ServerClock` is an
//! explicitly constructed context that owns the local-to-server offset and the
//! task that keeps it fresh.
//!
//! Local time is read from a monotonic anchor: the wall-clock epoch is sampled
//! once at construction and advanced by `Instant` elapsed time afterwards, so a
//! local wall-clock jump mid-match cannot shift any derived countdown.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::debug;

/// Default refresh period for the server offset.
pub const OFFSET_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// One reading of the server's clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServerTimeSample {
    /// Server time in epoch milliseconds when it answered.
    pub server_time_ms: f64,
    /// Request round trip in milliseconds.
    pub round_trip_ms: f64,
}

enum TimeSource {
    Monotonic { anchor_epoch: f64, anchor: Instant },
    Manual { epoch_bits: AtomicU64 },
}

struct ClockInner {
    source: TimeSource,
    offset_ms_bits: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ClockInner {
    fn local_epoch(&self) -> f64 {
        match &self.source {
            TimeSource::Monotonic { anchor_epoch, anchor } => {
                anchor_epoch + anchor.elapsed().as_secs_f64()
            }
            TimeSource::Manual { epoch_bits } => f64::from_bits(epoch_bits.load(Ordering::SeqCst)),
        }
    }

    /// Offset of `sample` against the local monotonic epoch, taken as the
    /// sample arrives. The server answered half a round trip ago.
    fn offset_for(&self, sample: ServerTimeSample) -> Option<f64> {
        let server_now_ms = sample.server_time_ms + sample.round_trip_ms.max(0.0) / 2.0;
        let offset_ms = server_now_ms - self.local_epoch() * 1000.0;
        offset_ms.is_finite().then_some(offset_ms)
    }
}

impl Drop for ClockInner {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

/// Shared handle to the server clock. Cloning is cheap.
#[derive(Clone)]
pub struct ServerClock {
    inner: Arc<ClockInner>,
}

impl std::fmt::Debug for ServerClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClock")
            .field("now_epoch", &self.now_epoch())
            .field("offset_ms", &self.offset_ms())
            .finish()
    }
}

impl ServerClock {
    /// Clock backed by the local system time with a zero offset.
    pub fn system() -> Self {
        let anchor_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self::with_source(TimeSource::Monotonic {
            anchor_epoch,
            anchor: Instant::now(),
        })
    }

    /// Clock frozen at `epoch` until advanced explicitly.
    pub fn manual(epoch: f64) -> Self {
        Self::with_source(TimeSource::Manual {
            epoch_bits: AtomicU64::new(epoch.to_bits()),
        })
    }

    fn with_source(source: TimeSource) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                source,
                offset_ms_bits: AtomicU64::new(0f64.to_bits()),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Local time in epoch seconds, before the server offset is applied.
    pub fn local_epoch(&self) -> f64 {
        self.inner.local_epoch()
    }

    /// Approximate server time in epoch seconds.
    pub fn now_epoch(&self) -> f64 {
        self.local_epoch() + self.offset_ms() / 1000.0
    }

    /// Current local-to-server offset in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        f64::from_bits(self.inner.offset_ms_bits.load(Ordering::SeqCst))
    }

    /// Replace the server offset.
    pub fn set_offset_ms(&self, offset_ms: f64) {
        if offset_ms.is_finite() {
            self.inner.offset_ms_bits.store(offset_ms.to_bits(), Ordering::SeqCst);
        }
    }

    /// Set the offset from a fresh server reading. Returns the new offset.
    pub fn apply_sample(&self, sample: ServerTimeSample) -> Option<f64> {
        let offset_ms = self.inner.offset_for(sample)?;
        self.inner.offset_ms_bits.store(offset_ms.to_bits(), Ordering::SeqCst);
        Some(offset_ms)
    }

    /// Advance a manual clock. No-op on a system clock.
    pub fn advance(&self, seconds: f64) {
        if let TimeSource::Manual { epoch_bits } = &self.inner.source {
            let now = f64::from_bits(epoch_bits.load(Ordering::SeqCst));
            epoch_bits.store((now + seconds).to_bits(), Ordering::SeqCst);
        }
    }

    /// Set a manual clock to an absolute epoch. No-op on a system clock.
    pub fn set(&self, epoch: f64) {
        if let TimeSource::Manual { epoch_bits } = &self.inner.source {
            epoch_bits.store(epoch.to_bits(), Ordering::SeqCst);
        }
    }

    /// Whether an offset refresh task is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .poller
            .lock()
            .map(|poller| poller.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Start refreshing the offset every `interval` using `fetch`.
    ///
    /// `fetch` returns `None` when the server could not be read; the previous
    /// offset is kept. Calling `start` on a running clock is a no-op.
    pub fn start<F, Fut>(&self, interval: Duration, fetch: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ServerTimeSample>> + Send + 'static,
    {
        let Ok(mut poller) = self.inner.poller.lock() else {
            return;
        };
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak: Weak<ClockInner> = Arc::downgrade(&self.inner);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let fetched = fetch().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Some(offset_ms) = fetched.and_then(|sample| inner.offset_for(sample)) {
                    inner.offset_ms_bits.store(offset_ms.to_bits(), Ordering::SeqCst);
                    debug!("server clock offset refreshed: {:.1} ms", offset_ms);
                }
            }
        }));
    }

    /// Stop the refresh task. The last known offset stays in effect.
    pub fn stop(&self) {
        if let Ok(mut poller) = self.inner.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

/// Whole seconds left until `end_epoch`, rounded up, never negative.
pub fn seconds_until(end_epoch: f64, now_epoch: f64) -> u32 {
    let remaining = (end_epoch - now_epoch).ceil();
    if remaining.is_finite() && remaining > 0.0 {
        remaining as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ServerClock::manual(1_000.0);
        assert_eq!(clock.now_epoch(), 1_000.0);

        clock.advance(2.5);
        assert_eq!(clock.now_epoch(), 1_002.5);

        clock.set(50.0);
        assert_eq!(clock.now_epoch(), 50.0);
    }

    #[test]
    fn test_offset_applies_in_seconds() {
        let clock = ServerClock::manual(100.0);
        clock.set_offset_ms(1_500.0);
        assert_eq!(clock.now_epoch(), 101.5);

        clock.set_offset_ms(f64::NAN);
        assert_eq!(clock.offset_ms(), 1_500.0);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = ServerClock::system();
        let a = clock.now_epoch();
        let b = clock.now_epoch();
        assert!(b >= a);
        assert!(a > 1_600_000_000.0);
    }

    #[test]
    fn test_clones_share_offset() {
        let clock = ServerClock::manual(0.0);
        let other = clock.clone();
        other.set_offset_ms(-250.0);
        assert_eq!(clock.now_epoch(), -0.25);
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        assert_eq!(seconds_until(10.0, 5.0), 5);
        assert_eq!(seconds_until(10.0, 9.1), 1);
        assert_eq!(seconds_until(10.0, 10.0), 0);
        assert_eq!(seconds_until(10.0, 12.0), 0);
        assert_eq!(seconds_until(f64::NAN, 0.0), 0);
    }

    #[test]
    fn test_sample_offset_is_measured_against_local_epoch() {
        let clock = ServerClock::manual(1_000.0);
        let sample = ServerTimeSample { server_time_ms: 5_000_000.0, round_trip_ms: 200.0 };
        assert_eq!(clock.apply_sample(sample), Some(4_000_100.0));
        assert!((clock.now_epoch() - 5_000.1).abs() < 1e-6);

        // Both sides move on by ten seconds; the offset does not move.
        clock.advance(10.0);
        let later = ServerTimeSample { server_time_ms: 5_010_000.0, round_trip_ms: 200.0 };
        assert_eq!(clock.apply_sample(later), Some(4_000_100.0));
        assert!((clock.now_epoch() - 5_010.1).abs() < 1e-6);

        let broken = ServerTimeSample { server_time_ms: f64::NAN, round_trip_ms: 0.0 };
        assert_eq!(clock.apply_sample(broken), None);
        assert_eq!(clock.offset_ms(), 4_000_100.0);
    }

    #[tokio::test]
    async fn test_start_and_stop_refresh() {
        let clock = ServerClock::manual(0.0);
        clock.start(Duration::from_millis(5), || async {
            Some(ServerTimeSample { server_time_ms: 42.0, round_trip_ms: 0.0 })
        });
        assert!(clock.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(clock.offset_ms(), 42.0);

        clock.stop();
        assert!(!clock.is_running());
    }
}
