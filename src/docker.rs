//! Docker container backend
//!
//! Containers are named `org.repo.commit`, one per branch head. Start
//! and stop are idempotent against the daemon's 404/304/409 responses so
//! that concurrent requests and the reaper can race without harm.

use crate::app::AppId;
use crate::backend::{AppState, Backend};
use crate::config::Config;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{ContainerInspectResponse, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::Uri;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bound on the hot-path health probe so a dead container cannot stall
/// the request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry budget for always-on containers before the daemon gives up on
/// restarting them.
const ALWAYS_ON_MAX_RETRIES: i64 = 10;

/// Docker-backed implementation of [`Backend`]
pub struct DockerBackend {
    client: Docker,
    config: Config,
    probe: reqwest::Client,
}

impl DockerBackend {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority:
    /// 1. Explicit `general.docker_host` from the configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform default socket
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let client = if let Some(host) = config.general.docker_host.as_deref() {
            Self::connect_to_host(host, "general.docker_host")?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, "DOCKER_HOST")?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure dockerd is running or set general.docker_host.",
                e
            )
        })?;

        let probe = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("reqwest client with static configuration");

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            config,
            probe,
        })
    }

    /// `origin` names where the endpoint value came from
    /// (`general.docker_host` or the DOCKER_HOST environment variable),
    /// so connection failures point back at the right knob.
    fn connect_to_host(host: &str, origin: &str) -> anyhow::Result<Docker> {
        if let Some(socket) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                anyhow::anyhow!(
                    "{} points at socket '{}', which is not usable: {}",
                    origin,
                    socket,
                    e
                )
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                anyhow::anyhow!("{} points at '{}', which is not usable: {}", origin, host, e)
            })
        } else {
            anyhow::bail!(
                "{} is '{}', which is neither unix:///path/to/docker.sock nor tcp://host:port",
                origin,
                host
            )
        }
    }

    async fn inspect(&self, app: &AppId) -> Option<ContainerInspectResponse> {
        match self.client.inspect_container(&app.container_name(), None).await {
            Ok(info) => Some(info),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => None,
            Err(e) => {
                warn!(app = %app, error = %e, "Failed to inspect container");
                None
            }
        }
    }

    async fn create_container(&self, app: &AppId) -> anyhow::Result<()> {
        let repo_config = self.config.get_repo(&app.org, &app.repo).ok_or_else(|| {
            anyhow::anyhow!("No repository configuration for {}/{}", app.org, app.repo)
        })?;

        let restart_policy = if self.config.is_always_on(&app.org, &app.repo, &app.branch) {
            RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(ALWAYS_ON_MAX_RETRIES),
            }
        } else {
            RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }
        };

        let host_config = HostConfig {
            publish_all_ports: Some(true),
            restart_policy: Some(restart_policy),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(repo_config.docker_image.clone()),
            hostname: Some(app.container_name()),
            env: Some(vec![
                format!("BRANCHGATE_ORG={}", app.org),
                format!("BRANCHGATE_REPO={}", app.repo),
                format!("BRANCHGATE_COMMIT={}", app.commit),
            ]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: app.container_name(),
            platform: None,
        };

        match self.client.create_container(Some(options), container_config).await {
            Ok(response) => {
                info!(
                    app = %app,
                    container_id = response.id,
                    image = repo_config.docker_image,
                    "Created container"
                );
                Ok(())
            }
            // Lost a create race; the winner's container is fine.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to create container '{}' from image '{}': {}",
                app.container_name(),
                repo_config.docker_image,
                e
            )),
        }
    }

    /// First host port published by the container, if any.
    fn published_port(inspect: &ContainerInspectResponse) -> Option<u16> {
        inspect
            .network_settings
            .as_ref()?
            .ports
            .as_ref()?
            .values()
            .flatten()
            .flatten()
            .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
    }

    fn is_running(inspect: &ContainerInspectResponse) -> bool {
        inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false)
    }

    fn health_check_path(&self, app: &AppId) -> String {
        self.config
            .get_repo(&app.org, &app.repo)
            .map(|r| r.health_check_path.clone())
            .unwrap_or_else(|| "/".to_string())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, app: &AppId) -> anyhow::Result<()> {
        match self.inspect(app).await {
            Some(inspect) if Self::is_running(&inspect) => {
                debug!(app = %app, "Container already running");
                return Ok(());
            }
            Some(_) => {}
            None => self.create_container(app).await?,
        }

        match self
            .client
            .start_container(&app.container_name(), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(app = %app, "Started container");
                Ok(())
            }
            // 304: already started between inspect and here.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to start container '{}': {}",
                app.container_name(),
                e
            )),
        }
    }

    async fn stop(&self, app: &AppId) -> anyhow::Result<()> {
        // Force-remove rather than stop, so the next start recreates the
        // container from the current image.
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(&app.container_name(), Some(options))
            .await
        {
            Ok(()) => {
                info!(app = %app, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(app = %app, "Container already gone");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to remove container '{}': {}",
                app.container_name(),
                e
            )),
        }
    }

    async fn state(&self, app: &AppId) -> AppState {
        let Some(inspect) = self.inspect(app).await else {
            return AppState::Down;
        };
        if !Self::is_running(&inspect) {
            return AppState::Down;
        }
        let Some(port) = Self::published_port(&inspect) else {
            return AppState::Down;
        };

        let url = format!(
            "http://{}:{}{}",
            self.config.general.docker_address,
            port,
            self.health_check_path(app)
        );

        match self.probe.get(&url).send().await {
            Ok(response) if response.status().is_success() => AppState::Up,
            Ok(response) => {
                debug!(app = %app, status = %response.status(), "Health check failed");
                AppState::Down
            }
            Err(e) => {
                debug!(app = %app, error = %e, "Health check unreachable");
                AppState::Down
            }
        }
    }

    async fn modify_url(&self, uri: &mut Uri, app: &AppId) -> bool {
        let Some(inspect) = self.inspect(app).await else {
            return false;
        };
        if !Self::is_running(&inspect) {
            return false;
        }
        let Some(port) = Self::published_port(&inspect) else {
            return false;
        };

        let authority = format!("{}:{}", self.config.general.docker_address, port);
        let Ok(authority) = authority.parse() else {
            return false;
        };

        let mut parts = std::mem::take(uri).into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(authority);
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        match Uri::from_parts(parts) {
            Ok(rewritten) => {
                *uri = rewritten;
                true
            }
            Err(_) => false,
        }
    }

    async fn logs(&self, app: &AppId, tx: mpsc::Sender<String>) -> anyhow::Result<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let mut stream = self.client.logs(&app.container_name(), Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    let message = match output {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => message,
                        LogOutput::StdIn { .. } => continue,
                    };
                    let Ok(text) = String::from_utf8(message.to_vec()) else {
                        continue;
                    };
                    for line in text.lines() {
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(line.to_string()).await.is_err() {
                            // Reader went away; stop following.
                            debug!(app = %app, "Log stream reader disconnected");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Error reading logs for '{}': {}",
                        app.container_name(),
                        e
                    ));
                }
            }
        }

        debug!(app = %app, "Container log stream ended");
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<AppId>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        let apps = containers
            .into_iter()
            .filter_map(|c| c.names?.into_iter().next())
            .filter_map(|name| AppId::from_container_name(&name))
            .collect();

        Ok(apps)
    }
}
