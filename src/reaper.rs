//! Idle reclamation
//!
//! A periodic task that stops apps nobody has touched within the idle
//! budget. Reserved apps are exempt. The stale snapshot is taken under
//! the registry lock and all backend calls happen after the lock is
//! released; a failed stop leaves the entry in place so the next tick
//! retries it.

use crate::app::AppId;
use crate::backend::SharedBackend;
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the reaper sweeps
pub const TICK: Duration = Duration::from_secs(10);

/// Read-only reservation membership test, injected so the reaper does
/// not hold a reference to the reservation set itself.
pub type IsReserved = Arc<dyn Fn(&AppId) -> bool + Send + Sync>;

pub struct Reaper {
    registry: Arc<Registry>,
    backend: SharedBackend,
    is_reserved: IsReserved,
    idle: Duration,
    tick: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<Registry>,
        backend: SharedBackend,
        is_reserved: IsReserved,
        idle: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            is_reserved,
            idle,
            tick: TICK,
        }
    }

    /// Override the sweep interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            idle_secs = self.idle.as_secs(),
            tick_secs = self.tick.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep: snapshot stale apps, drop the reserved ones, stop the
    /// rest and forget them on success.
    pub async fn sweep(&self) {
        let stale = self.registry.stale(self.idle);
        if stale.is_empty() {
            return;
        }

        let candidates: Vec<AppId> = stale
            .into_iter()
            .filter(|app| {
                if (self.is_reserved)(app) {
                    debug!(app = %app, "Skipping reserved app");
                    false
                } else {
                    true
                }
            })
            .collect();

        for app in candidates {
            match self.backend.stop(&app).await {
                Ok(()) => {
                    info!(app = %app, "Stopped idle app");
                    self.registry.forget(&app);
                }
                Err(e) => {
                    warn!(app = %app, error = %e, "Failed to stop idle app, will retry next tick");
                }
            }
        }
    }
}
