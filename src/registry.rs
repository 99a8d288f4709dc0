//! Last-touch registry driving idle reclamation
//!
//! One entry per AppId, keyed by the full `org.repo.branch.commit` form.
//! Every mutation takes the same mutex, which is what gives the reaper
//! its ordering guarantee: a `touch` that completes before a tick's
//! `stale` snapshot is always visible to that snapshot.

use crate::app::AppId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Touch {
    at: Instant,
    wall: DateTime<Utc>,
}

/// In-memory table of last request times per app.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Touch>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for an app, creating the entry on first touch.
    /// `Instant::now()` is monotonic, so the stored timestamp never
    /// moves backwards.
    pub fn touch(&self, app: &AppId) {
        let touch = Touch {
            at: Instant::now(),
            wall: Utc::now(),
        };
        self.entries.lock().insert(app.key(), touch);
    }

    /// Drop an app's entry. Called by the reaper after a successful stop
    /// and by explicit lifecycle removals.
    pub fn forget(&self, app: &AppId) {
        self.entries.lock().remove(&app.key());
    }

    /// Wall-clock time of the last touch, for the health endpoint.
    pub fn get(&self, app: &AppId) -> Option<DateTime<Utc>> {
        self.entries.lock().get(&app.key()).map(|t| t.wall)
    }

    pub fn contains(&self, app: &AppId) -> bool {
        self.entries.lock().contains_key(&app.key())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of every app idle for longer than `idle`. The `now`
    /// reading happens under the lock, so any touch serialized before
    /// this call keeps its app out of the result.
    pub fn stale(&self, idle: Duration) -> Vec<AppId> {
        let entries = self.entries.lock();
        let now = Instant::now();
        entries
            .iter()
            .filter(|(_, touch)| now.duration_since(touch.at) > idle)
            .filter_map(|(key, _)| AppId::from_key(key))
            .collect()
    }
}
