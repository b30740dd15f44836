//! Periodic queue reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use super::sync::QueueSynchronizer;

/// Reconciles on a fixed interval and whenever a trigger arrives.
pub struct SyncScheduler {
    sync: Arc<QueueSynchronizer>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(sync: Arc<QueueSynchronizer>, interval: Duration) -> Self {
        Self {
            sync,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the loop on its own thread and runtime.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let sync = Arc::clone(&self.sync);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Queue sync scheduler could not start its runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual queue sync triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match sync.reconcile().await {
                        Ok((_, report)) if report.changed() => {
                            log::info!(
                                "Queue sync: {} added, {} advanced, {} confirmed",
                                report.added.len(),
                                report.advanced.len(),
                                report.confirmed.len()
                            );
                        }
                        Err(e) => log::error!("Queue sync failed: {}", e),
                        _ => {}
                    }
                }
            });
        })
    }

    /// Signals the loop to stop after its current pass.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
