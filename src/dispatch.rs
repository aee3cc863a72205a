//! Background metering tasks.
//!
//! Every metered call hands its payload to [`MeteringDispatcher::dispatch`],
//! which builds and delivers it on a tracked tokio task. The caller never
//! waits on delivery; [`MeteringDispatcher::flush`] is the only blocking
//! point and is invoked explicitly by the host.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::delivery::MeteringDelivery;
use crate::payload::{CallKind, MeteringPayload};

/// Counters over the dispatcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Dispatches dropped because no tokio runtime was available.
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct MeteringDispatcher {
    tracker: TaskTracker,
    delivery: Arc<MeteringDelivery>,
    counters: Arc<Counters>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MeteringDispatcher {
    pub fn new(delivery: MeteringDelivery) -> Self {
        Self {
            tracker: TaskTracker::new(),
            delivery: Arc::new(delivery),
            counters: Arc::new(Counters::default()),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn delivery(&self) -> &MeteringDelivery {
        &self.delivery
    }

    /// Build and deliver a payload in the background.
    ///
    /// `build` runs on the background task, so extraction cost and any panic
    /// it raises stay off the caller's path.
    pub fn dispatch<F>(&self, kind: CallKind, build: F)
    where
        F: FnOnce() -> MeteringPayload + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%kind, "no tokio runtime available, metering skipped");
            return;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let delivery = Arc::clone(&self.delivery);
        let counters = Arc::clone(&self.counters);

        let work = async move {
            let payload = build();
            delivery.deliver(kind, &payload).await
        };

        self.tracker.spawn_on(
            async move {
                match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(Ok(report)) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            %kind,
                            attempts = report.attempts,
                            transaction_id = report.transaction_id.as_deref().unwrap_or(""),
                            "metering delivered"
                        );
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(%kind, error = %e, "failed to send metering data");
                    }
                    Err(panic) => {
                        counters.panicked.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            %kind,
                            panic = %panic_message(panic.as_ref()),
                            "metering task panicked"
                        );
                    }
                }
            },
            &handle,
        );
    }

    /// Wait for every dispatched task to finish. The dispatcher stays usable.
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::debug!(pending, "flushing metering tasks");
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
