//! Reservation set: apps immune to idle reclamation
//!
//! Reserved apps are the union of configured always-on branch heads and
//! branches with an open pull request. Adding a reservation starts the
//! app; removing one stops it. The set is keyed on the container triple
//! `org.repo.commit`, matching how the backend names containers, and is
//! only ever updated from startup reconciliation and webhook events.

use crate::app::AppId;
use crate::backend::SharedBackend;
use crate::config::Config;
use crate::github::GithubClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

/// Why an app is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationSource {
    /// Listed under always_on in the repository configuration
    AlwaysOn,
    /// Head of a currently open pull request
    OpenPullRequest,
}

#[derive(Debug, Clone)]
struct Reservation {
    app: AppId,
    source: ReservationSource,
}

/// Set of apps the reaper must never stop
pub struct ReservationSet {
    backend: SharedBackend,
    entries: Mutex<HashMap<String, Reservation>>,
}

impl ReservationSet {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve an app and ensure it is running. Idempotent: re-adding an
    /// existing reservation refreshes its source tag and re-issues the
    /// (idempotent) start.
    pub async fn add(&self, app: AppId, source: ReservationSource) {
        {
            let mut entries = self.entries.lock();
            entries.insert(
                app.container_name(),
                Reservation {
                    app: app.clone(),
                    source,
                },
            );
        }

        info!(app = %app, source = ?source, "Reserved app");
        if let Err(e) = self.backend.start(&app).await {
            warn!(app = %app, error = %e, "Failed to start reserved app");
        }
    }

    /// Drop a reservation and stop the app.
    pub async fn remove(&self, app: &AppId) {
        let removed = self.entries.lock().remove(&app.container_name());

        if removed.is_some() {
            info!(app = %app, "Reservation removed");
        }
        if let Err(e) = self.backend.stop(app).await {
            warn!(app = %app, error = %e, "Failed to stop unreserved app");
        }
    }

    /// Drop every reservation for a branch and stop the apps. Used when
    /// a pull request closes: the head commit recorded at open time may
    /// have been superseded by pushes since.
    pub async fn remove_branch(&self, org: &str, repo: &str, branch: &str) {
        let removed: Vec<AppId> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, r)| {
                    r.app.org == org && r.app.repo == repo && r.app.branch == branch
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| entries.remove(k))
                .map(|r| r.app)
                .collect()
        };

        for app in removed {
            info!(app = %app, "Reservation removed");
            if let Err(e) = self.backend.stop(&app).await {
                warn!(app = %app, error = %e, "Failed to stop unreserved app");
            }
        }
    }

    /// Move a branch's reservation to a new head commit: stop and drop
    /// any entry for the same branch at an older commit, then reserve
    /// and start the new one.
    pub async fn advance_branch(&self, app: AppId, source: ReservationSource) {
        let superseded: Vec<AppId> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, r)| {
                    r.app.org == app.org
                        && r.app.repo == app.repo
                        && r.app.branch == app.branch
                        && r.app.commit != app.commit
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| entries.remove(k))
                .map(|r| r.app)
                .collect()
        };

        for old in superseded {
            info!(app = %old, "Stopping superseded branch head");
            if let Err(e) = self.backend.stop(&old).await {
                warn!(app = %old, error = %e, "Failed to stop superseded app");
            }
        }

        self.add(app, source).await;
    }

    /// Whether this app's container is reserved. Membership is by the
    /// container triple, so the advisory branch does not matter.
    pub fn contains(&self, app: &AppId) -> bool {
        self.entries.lock().contains_key(&app.container_name())
    }

    /// Whether any reservation exists for this branch, at any commit.
    pub fn is_branch_reserved(&self, org: &str, repo: &str, branch: &str) -> bool {
        self.entries
            .lock()
            .values()
            .any(|r| r.app.org == org && r.app.repo == repo && r.app.branch == branch)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Seed the set at startup: resolve every always-on branch to its
    /// current head and reserve it. Pull request heads are not swept
    /// here; they enter through their open/close webhook events. API
    /// failures are logged and skipped; a branch that fails to resolve
    /// is picked up again by its next push event.
    pub async fn reconcile(&self, config: &Config, github: &GithubClient) {
        for (name, repo_config) in &config.repository {
            let Some((org, repo)) = name.split_once('/') else {
                warn!(repository = name, "Skipping malformed repository key");
                continue;
            };

            for branch in &repo_config.always_on {
                match github.get_reference(org, repo, branch).await {
                    Ok(sha) => {
                        let app = AppId::new(org, repo, branch, &sha);
                        self.add(app, ReservationSource::AlwaysOn).await;
                    }
                    Err(e) => {
                        warn!(org, repo, branch, error = %e, "Failed to resolve always-on branch");
                    }
                }
            }
        }

        info!(reserved = self.len(), "Reservation set reconciled");
    }
}
