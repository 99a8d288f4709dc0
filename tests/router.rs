//! Integration tests for the branchgate router
//!
//! Each test boots the real router server against a recording mock
//! backend and drives it over raw TCP, the way a browser or webhook
//! delivery would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use branchgate::app::AppId;
use branchgate::backend::{AppState, Backend, SharedBackend};
use branchgate::config::Config;
use branchgate::github::{sign_payload, GithubClient};
use branchgate::proxy::ProxyClient;
use branchgate::registry::Registry;
use branchgate::reserved::ReservationSet;
use branchgate::server::{RouterServer, RouterState};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const SECRET: &str = "hook-secret";

#[derive(Debug, Clone, Default)]
struct ContainerState {
    running: bool,
    port: Option<u16>,
    healthy: bool,
}

/// Scriptable in-memory backend that records every lifecycle call.
#[derive(Default)]
struct MockBackend {
    containers: Mutex<HashMap<String, ContainerState>>,
    started: Mutex<Vec<AppId>>,
    stopped: Mutex<Vec<AppId>>,
}

impl MockBackend {
    fn set_running(&self, app: &AppId, port: u16, healthy: bool) {
        self.containers.lock().insert(
            app.container_name(),
            ContainerState {
                running: true,
                port: Some(port),
                healthy,
            },
        );
    }

    fn started_containers(&self) -> Vec<String> {
        self.started.lock().iter().map(|a| a.container_name()).collect()
    }

    fn stopped_containers(&self) -> Vec<String> {
        self.stopped.lock().iter().map(|a| a.container_name()).collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, app: &AppId) -> anyhow::Result<()> {
        self.started.lock().push(app.clone());
        self.containers
            .lock()
            .entry(app.container_name())
            .or_default()
            .running = true;
        Ok(())
    }

    async fn stop(&self, app: &AppId) -> anyhow::Result<()> {
        self.stopped.lock().push(app.clone());
        self.containers.lock().remove(&app.container_name());
        Ok(())
    }

    async fn state(&self, app: &AppId) -> AppState {
        let containers = self.containers.lock();
        match containers.get(&app.container_name()) {
            Some(c) if c.running && c.port.is_some() && c.healthy => AppState::Up,
            _ => AppState::Down,
        }
    }

    async fn modify_url(&self, uri: &mut hyper::Uri, app: &AppId) -> bool {
        let port = {
            let containers = self.containers.lock();
            match containers.get(&app.container_name()) {
                Some(c) if c.running => c.port,
                _ => None,
            }
        };
        let Some(port) = port else {
            return false;
        };

        let mut parts = std::mem::take(uri).into_parts();
        parts.scheme = Some(hyper::http::uri::Scheme::HTTP);
        parts.authority = format!("127.0.0.1:{}", port).parse().ok();
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
        }
        match hyper::Uri::from_parts(parts) {
            Ok(rewritten) => {
                *uri = rewritten;
                true
            }
            Err(_) => false,
        }
    }

    async fn logs(&self, _app: &AppId, tx: mpsc::Sender<String>) -> anyhow::Result<()> {
        let _ = tx.send("listening on :3000".to_string()).await;
        let _ = tx.send("GET / 200".to_string()).await;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<AppId>> {
        Ok(self
            .containers
            .lock()
            .keys()
            .filter_map(|name| AppId::from_container_name(name))
            .collect())
    }
}

fn test_config() -> Config {
    toml::from_str(
        r#"
        [general]
        idle_shutdown = "5m"
        server_address = "http://router.test"

        [github]
        token = "test-token"
        secret = "hook-secret"

        [repository."acme/web"]
        default_branch = "main"
        default_repo = true
        always_on = ["main"]
        docker_image = "acme/web"
        health_check_path = "/"
        "#,
    )
    .expect("valid test config")
}

struct TestRouter {
    port: u16,
    backend: Arc<MockBackend>,
    state: Arc<RouterState>,
    _shutdown_tx: watch::Sender<bool>,
}

/// Boot a router on the given port against a fresh mock backend.
async fn start_router(port: u16, github_api_base: Option<String>) -> TestRouter {
    let backend = Arc::new(MockBackend::default());
    let shared: SharedBackend = backend.clone();

    let mut github = GithubClient::new("test-token", SECRET);
    if let Some(base) = github_api_base {
        github = github.with_api_base(&base);
    } else {
        // Point at a closed port so stray API calls fail fast.
        github = github.with_api_base("http://127.0.0.1:9");
    }

    let state = Arc::new(RouterState {
        config: test_config(),
        backend: shared.clone(),
        registry: Arc::new(Registry::new()),
        reservations: Arc::new(ReservationSet::new(shared)),
        github: Arc::new(github),
        proxy: ProxyClient::new(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = RouterServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        Arc::clone(&state),
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "router did not start on port {}",
        port
    );

    TestRouter {
        port,
        backend,
        state,
        _shutdown_tx: shutdown_tx,
    }
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and return the full response text.
async fn send_raw(port: u16, raw: String) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .expect("connect to router");
    stream.write_all(raw.as_bytes()).await.expect("send request");

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response");
    String::from_utf8_lossy(&response).to_string()
}

async fn http_get(port: u16, path: &str) -> String {
    send_raw(
        port,
        format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            path, port
        ),
    )
    .await
}

async fn post_hook(port: u16, event: &str, payload: &str, signature: &str) -> String {
    send_raw(
        port,
        format!(
            "POST /hooks/github HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\
             X-GitHub-Event: {}\r\nX-Hub-Signature: {}\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            port,
            event,
            signature,
            payload.len(),
            payload
        ),
    )
    .await
}

fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("response has a status line")
}

fn header_of(response: &str, name: &str) -> Option<String> {
    let lower = format!("{}:", name.to_lowercase());
    response
        .lines()
        .take_while(|line| !line.trim_end().is_empty())
        .find(|line| line.to_lowercase().starts_with(&lower))
        .map(|line| line[lower.len()..].trim().to_string())
}

/// Build a raw HTTP/1.1 response with a correct Content-Length.
fn stub_response(status_line: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        extra_headers,
        body.len(),
        body
    )
}

/// Spawn a stub upstream that answers every request with `response` and
/// records the request line of each request it sees.
async fn spawn_stub_upstream(response: String) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_clone = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen_clone);
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if let Some(line) = String::from_utf8_lossy(&buf[..n]).lines().next() {
                    seen.lock().push(line.to_string());
                }
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (port, seen)
}

#[tokio::test]
async fn test_cold_start_redirects_to_wait_page() {
    let router = start_router(18311, None).await;

    let response = http_get(router.port, "/app/acme/web/abcdef1234567/").await;

    assert_eq!(status_of(&response), 307);
    assert_eq!(
        header_of(&response, "location").as_deref(),
        Some("/wait/acme/web/abcdef1")
    );
    // The hot path issued exactly one start, keyed on the short commit.
    assert_eq!(router.backend.started_containers(), vec!["acme.web.abcdef1"]);
}

#[tokio::test]
async fn test_warm_path_proxies_with_stripped_prefix() {
    let (upstream_port, seen) =
        spawn_stub_upstream(stub_response("200 OK", "", "hello from upstream")).await;

    let router = start_router(18312, None).await;
    let app = AppId::new("acme", "web", "", "abcdef1");
    router.backend.set_running(&app, upstream_port, true);

    let response = http_get(router.port, "/app/acme/web/abcdef1/users/42").await;

    assert_eq!(status_of(&response), 200);
    assert!(response.contains("hello from upstream"));
    assert_eq!(seen.lock().as_slice(), &["GET /users/42 HTTP/1.1"]);
    // Nothing needed starting.
    assert!(router.backend.started_containers().is_empty());
}

#[tokio::test]
async fn test_relative_redirect_is_rewritten() {
    let (upstream_port, _) =
        spawn_stub_upstream(stub_response("302 Found", "Location: /login\r\n", "")).await;

    let router = start_router(18313, None).await;
    let app = AppId::new("acme", "web", "", "abcdef1");
    router.backend.set_running(&app, upstream_port, true);

    let response = http_get(router.port, "/app/acme/web/abcdef1/dashboard").await;

    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_of(&response, "location").as_deref(),
        Some("/app/acme/web/abcdef1/login")
    );
}

#[tokio::test]
async fn test_absolute_redirect_passes_through() {
    let (upstream_port, _) = spawn_stub_upstream(stub_response(
        "302 Found",
        "Location: https://accounts.example.com/\r\n",
        "",
    ))
    .await;

    let router = start_router(18314, None).await;
    let app = AppId::new("acme", "web", "", "abcdef1");
    router.backend.set_running(&app, upstream_port, true);

    let response = http_get(router.port, "/app/acme/web/abcdef1/dashboard").await;

    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_of(&response, "location").as_deref(),
        Some("https://accounts.example.com/")
    );
}

#[tokio::test]
async fn test_branch_form_resolves_and_redirects() {
    // Stub GitHub API answering the ref lookup.
    let (github_port, _) = spawn_stub_upstream(stub_response(
        "200 OK",
        "Content-Type: application/json\r\n",
        r#"{"ref":"refs/heads/main","object":{"sha":"abcdef1234567890","type":"commit"}}"#,
    ))
    .await;

    let router = start_router(18315, Some(format!("http://127.0.0.1:{}", github_port))).await;

    let response = http_get(router.port, "/app/acme/web/main/users/42?tab=keys").await;

    assert_eq!(status_of(&response), 307);
    assert_eq!(
        header_of(&response, "location").as_deref(),
        Some("/app/acme/web/abcdef1/users/42?tab=keys")
    );
    // The resolved ref is registered under its branch-qualified key.
    let app = AppId::new("acme", "web", "main", "abcdef1");
    assert!(router.state.registry.get(&app).is_some());
}

#[tokio::test]
async fn test_unknown_repository_is_404() {
    let router = start_router(18316, None).await;

    let response = http_get(router.port, "/app/ghost/app/abcdef1/").await;

    assert_eq!(status_of(&response), 404);
    assert_eq!(
        header_of(&response, "x-router-error").as_deref(),
        Some("UNKNOWN_REPOSITORY")
    );
    assert!(router.backend.started_containers().is_empty());
}

#[tokio::test]
async fn test_wait_page_and_health() {
    let router = start_router(18317, None).await;

    let wait = http_get(router.port, "/wait/acme/web/abcdef1").await;
    assert_eq!(status_of(&wait), 200);
    assert!(wait.contains("/health/acme/web/abcdef1"));
    assert!(wait.contains("acme/web"));

    let health = http_get(router.port, "/health/acme/web/abcdef1").await;
    assert_eq!(status_of(&health), 200);
    assert!(health.contains("\"up\":false"));
    assert!(health.contains("\"last_request\":\""));

    let app = AppId::new("acme", "web", "", "abcdef1");
    router.backend.set_running(&app, 1, true);
    let health = http_get(router.port, "/health/acme/web/abcdef1").await;
    assert!(health.contains("\"up\":true"));
}

#[tokio::test]
async fn test_log_streaming_emits_sse_events() {
    let router = start_router(18318, None).await;

    let response = http_get(router.port, "/logs/acme/web/abcdef1").await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(
        header_of(&response, "content-type").as_deref(),
        Some("text/event-stream")
    );
    assert!(response.contains("event: log\ndata: listening on :3000"));
    assert!(response.contains("event: log\ndata: GET / 200"));
}

#[tokio::test]
async fn test_root_redirects_to_default_repo() {
    let router = start_router(18319, None).await;

    let response = http_get(router.port, "/").await;

    assert_eq!(status_of(&response), 307);
    assert_eq!(
        header_of(&response, "location").as_deref(),
        Some("/app/acme/web/main/")
    );
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let router = start_router(18320, None).await;

    let payload = r#"{"zen":"Keep it logically awesome."}"#;
    let response = post_hook(router.port, "ping", payload, "sha1=deadbeef").await;

    assert_eq!(status_of(&response), 400);
    assert_eq!(
        header_of(&response, "x-router-error").as_deref(),
        Some("INVALID_SIGNATURE")
    );
}

#[tokio::test]
async fn test_webhook_ping_and_unknown_events_are_accepted() {
    let router = start_router(18321, None).await;

    let payload = r#"{"zen":"Approachable is better than simple."}"#;
    let signature = sign_payload(SECRET, payload.as_bytes());

    let response = post_hook(router.port, "ping", payload, &signature).await;
    assert_eq!(status_of(&response), 200);

    let response = post_hook(router.port, "watch", payload, &signature).await;
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_pull_request_lifecycle() {
    let router = start_router(18322, None).await;

    let opened = serde_json::json!({
        "action": "opened",
        "repository": { "full_name": "acme/web" },
        "pull_request": {
            "number": 7,
            "state": "open",
            "head": { "ref": "feat", "sha": "deadbeefcafe0123" }
        }
    })
    .to_string();
    let signature = sign_payload(SECRET, opened.as_bytes());
    let response = post_hook(router.port, "pull_request", &opened, &signature).await;
    assert_eq!(status_of(&response), 200);

    let app = AppId::new("acme", "web", "feat", "deadbeefcafe0123");
    assert!(router.state.reservations.contains(&app));
    assert_eq!(router.backend.started_containers(), vec!["acme.web.deadbee"]);

    let closed = serde_json::json!({
        "action": "closed",
        "repository": { "full_name": "acme/web" },
        "pull_request": {
            "number": 7,
            "state": "closed",
            "head": { "ref": "feat", "sha": "deadbeefcafe0123" }
        }
    })
    .to_string();
    let signature = sign_payload(SECRET, closed.as_bytes());
    let response = post_hook(router.port, "pull_request", &closed, &signature).await;
    assert_eq!(status_of(&response), 200);

    assert!(!router.state.reservations.contains(&app));
    assert_eq!(router.backend.stopped_containers(), vec!["acme.web.deadbee"]);

    // A fresh request now triggers a brand new start.
    let response = http_get(router.port, "/app/acme/web/deadbee/").await;
    assert_eq!(status_of(&response), 307);
    assert_eq!(
        router.backend.started_containers(),
        vec!["acme.web.deadbee", "acme.web.deadbee"]
    );
}

#[tokio::test]
async fn test_push_restarts_reserved_branch_at_new_head() {
    // GitHub stub accepts the commit status post.
    let (github_port, _) = spawn_stub_upstream(stub_response(
        "201 Created",
        "Content-Type: application/json\r\n",
        "{}",
    ))
    .await;
    let router = start_router(18323, Some(format!("http://127.0.0.1:{}", github_port))).await;

    // Reserve the branch through a PR open.
    let opened = serde_json::json!({
        "action": "opened",
        "repository": { "full_name": "acme/web" },
        "pull_request": {
            "number": 7,
            "state": "open",
            "head": { "ref": "feat", "sha": "aaaaaaa111111" }
        }
    })
    .to_string();
    let signature = sign_payload(SECRET, opened.as_bytes());
    post_hook(router.port, "pull_request", &opened, &signature).await;

    // Push a new head to the reserved branch.
    let push = serde_json::json!({
        "ref": "refs/heads/feat",
        "after": "bbbbbbb222222",
        "repository": { "full_name": "acme/web" },
    })
    .to_string();
    let signature = sign_payload(SECRET, push.as_bytes());
    let response = post_hook(router.port, "push", &push, &signature).await;
    assert_eq!(status_of(&response), 200);

    let old = AppId::new("acme", "web", "feat", "aaaaaaa111111");
    let new = AppId::new("acme", "web", "feat", "bbbbbbb222222");
    assert!(!router.state.reservations.contains(&old));
    assert!(router.state.reservations.contains(&new));
    assert_eq!(router.backend.stopped_containers(), vec!["acme.web.aaaaaaa"]);
    assert_eq!(
        router.backend.started_containers(),
        vec!["acme.web.aaaaaaa", "acme.web.bbbbbbb"]
    );
}

#[tokio::test]
async fn test_push_to_unreserved_branch_does_not_restart() {
    let (github_port, _) = spawn_stub_upstream(stub_response(
        "201 Created",
        "Content-Type: application/json\r\n",
        "{}",
    ))
    .await;
    let router = start_router(18324, Some(format!("http://127.0.0.1:{}", github_port))).await;

    let push = serde_json::json!({
        "ref": "refs/heads/scratch",
        "after": "ccccccc333333",
        "repository": { "full_name": "acme/web" },
    })
    .to_string();
    let signature = sign_payload(SECRET, push.as_bytes());
    let response = post_hook(router.port, "push", &push, &signature).await;

    assert_eq!(status_of(&response), 200);
    assert!(router.backend.started_containers().is_empty());
    assert!(router.backend.stopped_containers().is_empty());
}
