//! Branchgate - an on-demand per-branch application router
//!
//! This library routes HTTP traffic of the form `/app/<org>/<repo>/<ref>`
//! to a Docker container running that branch head:
//! - Resolves branch refs to commits via the GitHub API
//! - Starts containers on demand and proxies requests to them
//! - Parks users on a polling wait page while a container boots
//! - Reaps containers that have been idle past a configurable budget
//! - Keeps always-on branches and open pull request heads running
//! - Reacts to GitHub webhooks: push statuses, PR open/close lifecycle
//! - Streams container logs over server-sent events

pub mod app;
pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod github;
pub mod hooks;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod reserved;
pub mod server;
