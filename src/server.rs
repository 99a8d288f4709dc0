//! HTTP surface of the router
//!
//! One listener serves every route:
//!
//! - `POST /hooks/:service` — webhook ingress
//! - `ANY  /app/:org/:repo/:ref_or_commit[/*path]` — the router itself
//! - `GET  /wait/:org/:repo/:commit` — polling wait page
//! - `GET  /health/:org/:repo/:commit` — availability JSON
//! - `GET  /logs/:org/:repo/:commit` — SSE container log stream
//! - `GET  /` — redirect to the configured default repository
//!
//! Every app-scoped route touches the registry on the way in, so an open
//! wait page or log stream keeps its app alive.

use crate::app::{looks_like_commit, AppId};
use crate::backend::AppState;
use crate::config::Config;
use crate::error::{json_error_response, RouterErrorCode};
use crate::github::GithubClient;
use crate::hooks;
use crate::proxy::ProxyClient;
use crate::registry::Registry;
use crate::reserved::ReservationSet;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST, LOCATION};
use hyper::http::uri::PathAndQuery;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::SharedBackend;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Everything a request handler needs, shared across connections.
pub struct RouterState {
    pub config: Config,
    pub backend: SharedBackend,
    pub registry: Arc<Registry>,
    pub reservations: Arc<ReservationSet>,
    pub github: Arc<GithubClient>,
    pub proxy: ProxyClient,
}

pub type SharedRouterState = Arc<RouterState>;

/// The router's HTTP server
pub struct RouterServer {
    bind_addr: SocketAddr,
    state: SharedRouterState,
    shutdown_rx: watch::Receiver<bool>,
}

impl RouterServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: SharedRouterState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Router listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, state).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: SharedRouterState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Incoming request");

    if method == Method::POST {
        if let Some(service) = path.strip_prefix("/hooks/") {
            let service = service.to_string();
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            return Ok(hooks::handle(&state, &service, &parts.headers, bytes).await);
        }
    }

    if path.starts_with("/app/") {
        return handle_app(req, state).await;
    }

    if method == Method::GET {
        if path == "/" {
            return Ok(handle_root(&state));
        }
        if let Some(app) = parse_triple(&path, "/wait/") {
            return Ok(handle_wait(&state, app));
        }
        if let Some(app) = parse_triple(&path, "/health/") {
            return Ok(handle_health(&state, app).await);
        }
        if let Some(app) = parse_triple(&path, "/logs/") {
            return Ok(handle_logs(&state, app));
        }
    }

    Ok(json_error_response(
        RouterErrorCode::InvalidPath,
        "No such route",
    ))
}

/// The `/app/...` routes: branch form resolves and redirects, commit
/// form ensures the container is up and proxies to it.
async fn handle_app(
    mut req: Request<Incoming>,
    state: SharedRouterState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some((org, repo, third, tail)) = parse_app_path(&path) else {
        return Ok(json_error_response(
            RouterErrorCode::InvalidPath,
            "Expected /app/<org>/<repo>/<ref>",
        ));
    };

    if state.config.get_repo(&org, &repo).is_none() {
        return Ok(json_error_response(
            RouterErrorCode::UnknownRepository,
            format!("No configuration for {}/{}", org, repo),
        ));
    }

    if !looks_like_commit(&third) {
        return Ok(handle_branch_form(&state, &org, &repo, &third, &tail, req.uri().query()).await);
    }

    // Hot path: the third segment is a commit.
    let app = AppId::new(&org, &repo, "", &third);
    state.registry.touch(&app);

    propagate_request_id(&mut req);
    set_original_request_header(&state.config, &mut req, &path);

    let mut target = req.uri().clone();
    let rewritten = state.backend.modify_url(&mut target, &app).await;
    let up = state.backend.state(&app).await == AppState::Up;

    if rewritten && up {
        if let Some(target) = strip_route_prefix(target, &tail, req.uri().query()) {
            return Ok(state.proxy.forward(req, target, &app).await);
        }
        warn!(app = %app, "Failed to rebuild proxy target, sending to wait page");
    }

    // Not routable yet: kick off a start and park the user on the wait
    // page. Start failures are logged; the wait page keeps polling.
    if let Err(e) = state.backend.start(&app).await {
        warn!(app = %app, error = %e, "Failed to start app");
    }

    Ok(redirect_response(&format!(
        "/wait/{}/{}/{}",
        app.org, app.repo, app.commit
    )))
}

/// Branch form: resolve the ref to its head commit and 307 to the commit
/// form, preserving method, body and query. Resolution failure degrades
/// to an empty commit; the redirect still happens and the wait page's
/// health polling reports the truth.
async fn handle_branch_form(
    state: &RouterState,
    org: &str,
    repo: &str,
    branch: &str,
    tail: &str,
    query: Option<&str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let commit = match state.github.get_reference(org, repo, branch).await {
        Ok(sha) => sha,
        Err(e) => {
            warn!(org, repo, branch, error = %e, "Failed to resolve ref");
            String::new()
        }
    };

    let app = AppId::new(org, repo, branch, &commit);
    state.registry.touch(&app);

    let mut location = format!("/app/{}/{}/{}{}", app.org, app.repo, app.commit, tail);
    if let Some(q) = query {
        location.push('?');
        location.push_str(q);
    }

    redirect_response(&location)
}

fn handle_root(state: &RouterState) -> Response<BoxBody<Bytes, hyper::Error>> {
    match state.config.default_repo() {
        Some((org, repo, conf)) => {
            let branch = conf.default_branch.as_deref().unwrap_or("main");
            redirect_response(&format!("/app/{}/{}/{}/", org, repo, branch))
        }
        None => json_error_response(RouterErrorCode::InvalidPath, "No default repository"),
    }
}

fn handle_wait(state: &RouterState, app: AppId) -> Response<BoxBody<Bytes, hyper::Error>> {
    state.registry.touch(&app);

    let body = WAIT_HTML
        .replace("{org}", &app.org)
        .replace("{repo}", &app.repo)
        .replace("{commit}", &app.commit);

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

async fn handle_health(state: &RouterState, app: AppId) -> Response<BoxBody<Bytes, hyper::Error>> {
    state.registry.touch(&app);

    let up = state.backend.state(&app).await == AppState::Up;
    let last_request = state.registry.get(&app).map(|t| t.to_rfc3339());

    let body = serde_json::json!({
        "app": app,
        "up": up,
        "last_request": last_request,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with static headers")
}

/// Stream container logs as server-sent events until the client hangs up
/// or the container stream ends.
fn handle_logs(state: &RouterState, app: AppId) -> Response<BoxBody<Bytes, hyper::Error>> {
    state.registry.touch(&app);

    let (tx, rx) = mpsc::channel::<String>(64);
    let backend = Arc::clone(&state.backend);
    let stream_app = app.clone();
    tokio::spawn(async move {
        if let Err(e) = backend.logs(&stream_app, tx).await {
            warn!(app = %stream_app, error = %e, "Log streaming ended with error");
        }
    });

    let events = ReceiverStream::new(rx).map(|line| {
        Ok::<_, hyper::Error>(Frame::data(Bytes::from(format!(
            "event: log\ndata: {}\n\n",
            line
        ))))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(StreamBody::new(events).boxed())
        .expect("valid response with static headers")
}

/// Generate or propagate the request ID (first trusted hop overwrites
/// nothing, missing gets a fresh UUID).
fn propagate_request_id(req: &mut Request<Incoming>) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }
}

/// Copy the original request URL into the configured header, for apps
/// that build fully-qualified redirects.
fn set_original_request_header(config: &Config, req: &mut Request<Incoming>, path: &str) {
    let Some(name) = config.general.original_request_header.as_deref() else {
        return;
    };

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let original = format!("http://{}{}", host, path);

    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&original),
    ) {
        (Ok(header), Ok(value)) => {
            req.headers_mut().insert(header, value);
        }
        _ => warn!(header = name, "Invalid original_request_header configuration"),
    }
}

/// Replace the routed URI's path with the app-relative remainder, keeping
/// scheme and authority from the backend rewrite.
fn strip_route_prefix(target: Uri, tail: &str, query: Option<&str>) -> Option<Uri> {
    let mut stripped = if tail.is_empty() { "/" } else { tail }.to_string();
    if let Some(q) = query {
        stripped.push('?');
        stripped.push_str(q);
    }

    let mut parts = target.into_parts();
    parts.path_and_query = Some(stripped.parse::<PathAndQuery>().ok()?);
    Uri::from_parts(parts).ok()
}

/// Split "/app/<org>/<repo>/<third>[/<rest>]" into its segments plus the
/// remainder path (leading slash included, empty when absent).
fn parse_app_path(path: &str) -> Option<(String, String, String, String)> {
    let rest = path.strip_prefix("/app/")?;
    let mut it = rest.splitn(4, '/');
    let org = it.next()?;
    let repo = it.next()?;
    let third = it.next()?;
    if org.is_empty() || repo.is_empty() || third.is_empty() {
        return None;
    }
    let tail = it.next().map(|t| format!("/{}", t)).unwrap_or_default();
    Some((org.to_string(), repo.to_string(), third.to_string(), tail))
}

/// Parse "<prefix><org>/<repo>/<commit>" into an AppId with no branch.
fn parse_triple(path: &str, prefix: &str) -> Option<AppId> {
    let rest = path.strip_prefix(prefix)?;
    let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != 3 {
        return None;
    }
    Some(AppId::new(parts[0], parts[1], "", parts[2]))
}

/// Plain-text response helper
pub(crate) fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// 307 keeps the method and body on the follow-up request, which is what
/// lets the branch form forward POSTs.
fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(LOCATION, location)
        .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

const WAIT_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Starting {org}/{repo} @ {commit}</title>
  <style>
    body { font-family: -apple-system, "Segoe UI", sans-serif; background: #f6f8fa; color: #24292f;
           display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
    .card { background: #fff; border: 1px solid #d0d7de; border-radius: 8px; padding: 2.5rem 3rem; text-align: center; }
    h1 { font-size: 1.25rem; margin: 0 0 0.5rem; }
    code { background: #f6f8fa; border-radius: 4px; padding: 0.1rem 0.4rem; }
    .hint { color: #57606a; font-size: 0.875rem; }
    .spinner { margin: 1.5rem auto 0; width: 28px; height: 28px; border: 3px solid #d0d7de;
               border-top-color: #0969da; border-radius: 50%; animation: spin 0.8s linear infinite; }
    @keyframes spin { to { transform: rotate(360deg); } }
  </style>
</head>
<body>
  <div class="card">
    <h1>Starting application</h1>
    <p>{org}/{repo} <code>{commit}</code></p>
    <p class="hint">You will be redirected once the instance answers its health check.</p>
    <div class="spinner"></div>
  </div>
  <script>
    const healthUrl = "/health/{org}/{repo}/{commit}";
    const appUrl = "/app/{org}/{repo}/{commit}/";
    async function poll() {
      try {
        const res = await fetch(healthUrl);
        const body = await res.json();
        if (body.up) {
          window.location.href = appUrl;
          return;
        }
      } catch (e) {
        // Router restarting; keep polling.
      }
      setTimeout(poll, 2000);
    }
    poll();
  </script>
</body>
</html>
"##;
