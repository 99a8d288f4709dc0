//! Webhook ingress
//!
//! Translates GitHub webhook deliveries into lifecycle transitions. The
//! payload signature is checked before anything else; a bad signature is
//! rejected with 400 and no side effects. Each event type is handled in
//! isolation: a malformed or failing event is logged and acknowledged,
//! never propagated back to GitHub as an error.

use crate::app::AppId;
use crate::error::{json_error_response, RouterErrorCode};
use crate::github::{branch_from_ref, PullRequestEvent, PushEvent, StatusState, EVENT_HEADER, SIGNATURE_HEADER};
use crate::reserved::ReservationSource;
use crate::server::{text_response, RouterState};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{HeaderMap, Response, StatusCode};
use tracing::{debug, info, warn};

/// Handle a webhook delivery. `service` names the source-control service
/// the hook was registered for; GitHub is the only wired provider.
pub async fn handle(
    state: &RouterState,
    service: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !state.github.verify_signature(&body, signature) {
        warn!(service, "Webhook signature validation failed");
        return json_error_response(RouterErrorCode::InvalidSignature, "Signature mismatch");
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    debug!(service, event_type, "Webhook received");

    match event_type {
        "ping" => {}
        "push" => handle_push(state, &body).await,
        "pull_request" => handle_pull_request(state, &body).await,
        other => {
            debug!(event_type = other, "Ignoring webhook event");
        }
    }

    text_response(StatusCode::OK, "OK")
}

/// Push: report a commit status pointing at the routed app URL, and if
/// the pushed branch is currently reserved, move its reservation (and
/// container) to the new head.
async fn handle_push(state: &RouterState, body: &Bytes) {
    let event: PushEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to parse push event");
            return;
        }
    };

    if event.is_branch_deletion() {
        debug!(ref_name = event.ref_name, "Ignoring branch deletion push");
        return;
    }

    let Some((org, repo)) = event.repository.org_repo() else {
        warn!(
            repository = event.repository.full_name,
            "Push event with malformed repository name"
        );
        return;
    };

    let branch = branch_from_ref(&event.ref_name);
    let app = AppId::new(org, repo, branch, &event.after);

    let target_url = format!(
        "{}/app/{}/{}/{}",
        state.config.general.server_address, app.org, app.repo, app.commit
    );
    if let Err(e) = state
        .github
        .create_status(&app.org, &app.repo, &event.after, StatusState::Success, &target_url)
        .await
    {
        warn!(app = %app, error = %e, "Failed to post commit status");
    }

    if state
        .reservations
        .is_branch_reserved(&app.org, &app.repo, &app.branch)
    {
        info!(app = %app, "Restarting reserved branch at new head");
        let source = if state.config.is_always_on(&app.org, &app.repo, &app.branch) {
            ReservationSource::AlwaysOn
        } else {
            ReservationSource::OpenPullRequest
        };
        state.reservations.advance_branch(app.clone(), source).await;
        state.registry.touch(&app);
    }
}

/// Pull request: open/reopen/synchronize reserves the head (starting
/// it); close drops the branch's reservations (stopping them).
async fn handle_pull_request(state: &RouterState, body: &Bytes) {
    let event: PullRequestEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to parse pull request event");
            return;
        }
    };

    let Some((org, repo)) = event.repository.org_repo() else {
        warn!(
            repository = event.repository.full_name,
            "Pull request event with malformed repository name"
        );
        return;
    };

    let head = &event.pull_request.head;
    let app = AppId::new(org, repo, &head.ref_name, &head.sha);

    match event.action.as_str() {
        "opened" | "reopened" | "synchronize" => {
            info!(app = %app, number = event.pull_request.number, action = event.action, "Reserving pull request head");
            state
                .reservations
                .advance_branch(app.clone(), ReservationSource::OpenPullRequest)
                .await;
            state.registry.touch(&app);
        }
        "closed" => {
            info!(app = %app, number = event.pull_request.number, "Pull request closed");
            state
                .reservations
                .remove_branch(&app.org, &app.repo, &app.branch)
                .await;
            state.registry.forget(&app);
        }
        other => {
            debug!(action = other, "Ignoring pull request action");
        }
    }
}
