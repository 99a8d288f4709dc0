//! Backend abstraction over the container runtime
//!
//! The router only ever talks to the runtime through this narrow
//! capability set, so a different runtime can slot in without touching
//! the lifecycle code. No runtime-specific types cross this boundary.

use crate::app::AppId;
use async_trait::async_trait;
use hyper::Uri;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Observed availability of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Container exists, is running, has a published port, and answers
    /// its health check with a 2xx.
    Up,
    /// Anything else.
    Down,
}

/// Container runtime capabilities the router relies on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    /// Ensure a container for the app exists and is running. Idempotent:
    /// starting a running app is a no-op, starting a missing one creates
    /// it first.
    async fn start(&self, app: &AppId) -> anyhow::Result<()>;

    /// Stop an app by force-removing its container, so the next `start`
    /// recreates it from the current image. Idempotent: a missing
    /// container is already stopped.
    async fn stop(&self, app: &AppId) -> anyhow::Result<()>;

    /// Probe the app, including an HTTP health check against its
    /// published port. The probe is time-bounded; failures map to
    /// [`AppState::Down`], never to an error.
    async fn state(&self, app: &AppId) -> AppState;

    /// Rewrite `uri` to point at the app's published port, keeping the
    /// path intact. Returns whether the rewrite happened; `false` means
    /// the container is not running or has no published port.
    async fn modify_url(&self, uri: &mut Uri, app: &AppId) -> bool;

    /// Stream container stdout+stderr lines into `tx`, follow-mode.
    /// Returns when the container stream ends or the receiver is
    /// dropped.
    async fn logs(&self, app: &AppId, tx: mpsc::Sender<String>) -> anyhow::Result<()>;

    /// Enumerate running containers that carry our naming scheme. Used
    /// once at startup to reconcile the registry.
    async fn list(&self) -> anyhow::Result<Vec<AppId>>;
}

/// Shared handle to the backend used across tasks.
pub type SharedBackend = Arc<dyn Backend>;
