//! Idle deadline shared by the reader and writer of a connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Deadline that moves forward every time the connection sees traffic
#[derive(Debug, Clone)]
pub struct IdleTimer {
    inner: Option<Arc<Inner>>,
}

#[derive(Debug)]
struct Inner {
    base: Instant,
    last_activity_ms: AtomicU64,
    timeout: Duration,
}

impl IdleTimer {
    /// `None` builds a timer that never fires
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: timeout.map(|timeout| {
                Arc::new(Inner {
                    base: Instant::now(),
                    last_activity_ms: AtomicU64::new(0),
                    timeout,
                })
            }),
        }
    }

    /// Record traffic, pushing the deadline out by the full timeout
    pub fn touch(&self) {
        if let Some(inner) = &self.inner {
            let elapsed = inner.base.elapsed().as_millis() as u64;
            inner.last_activity_ms.store(elapsed, Ordering::Relaxed);
        }
    }

    /// Resolves once no traffic was recorded for the whole timeout
    pub async fn expired(&self) {
        let Some(inner) = &self.inner else {
            return std::future::pending().await;
        };
        loop {
            let last = Duration::from_millis(inner.last_activity_ms.load(Ordering::Relaxed));
            let deadline = inner.base + last + inner.timeout;
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }

    /// Cancel `shutdown` when the timer expires; returns early once it is cancelled elsewhere
    pub async fn watch(self, shutdown: CancellationToken, what: &'static str) {
        tokio::select! {
            _ = self.expired() => {
                info!("{} idle timeout reached, closing", what);
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    }
}
