//! Tick backend: the only thing a scheduling implementation has to do is call back at a
//! cadence. Production deployments can swap in a distributed beat process; this crate ships
//! the in-process `tokio::time::interval` loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub type TickCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Uniform contract: call `tick_cb` at `interval` until `stop()`.
pub struct IntervalBackend {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Default for IntervalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalBackend {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self { stop_tx, stop_rx }
    }

    /// Runs `tick_cb` every `interval` until `stop()` is called. Intended to be spawned onto
    /// its own task.
    pub async fn start(&self, tick_cb: TickCallback, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick_cb().await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn health(&self) -> bool {
        !*self.stop_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn start_invokes_callback_on_each_tick_until_stopped() {
        let backend = Arc::new(IntervalBackend::new());
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = count.clone();
        let cb: TickCallback = Arc::new(move || {
            let cb_count = cb_count.clone();
            Box::pin(async move {
                cb_count.fetch_add(1, Ordering::SeqCst);
            })
        });

        let backend_clone = backend.clone();
        let handle = tokio::spawn(async move {
            backend_clone.start(cb, Duration::from_millis(10)).await;
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        backend.stop();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 3);
        assert!(!backend.health());
    }
}
