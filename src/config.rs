use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server and runtime settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// GitHub API and webhook settings
    #[serde(default)]
    pub github: GithubConfig,

    /// Per-repository settings, keyed by "org/repo"
    #[serde(default)]
    pub repository: HashMap<String, RepoConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// How long an app may go without a request before it is stopped
    #[serde(default = "default_idle_shutdown", deserialize_with = "deserialize_duration")]
    pub idle_shutdown: Duration,

    /// Listen address; ":8080" binds all interfaces on that port
    #[serde(default = "default_serve")]
    pub serve: String,

    /// External base URL used in commit status links (e.g. "https://apps.example.com")
    #[serde(default)]
    pub server_address: String,

    /// Docker daemon endpoint; falls back to DOCKER_HOST and then the
    /// platform socket defaults when unset
    pub docker_host: Option<String>,

    /// Host used to reach published container ports
    #[serde(default = "default_docker_address")]
    pub docker_address: String,

    /// Optional header carrying the original request URL into the app,
    /// for apps that emit fully-qualified redirects
    pub original_request_header: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            idle_shutdown: default_idle_shutdown(),
            serve: default_serve(),
            server_address: String::new(),
            docker_host: None,
            docker_address: default_docker_address(),
            original_request_header: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GithubConfig {
    /// API token for commit statuses and ref resolution
    #[serde(default)]
    pub token: String,

    /// Webhook secret for X-Hub-Signature validation
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    /// Branch the root redirect points at when this is the default repo
    pub default_branch: Option<String>,

    /// Whether "/" should land on this repository
    #[serde(default)]
    pub default_repo: bool,

    /// Branches kept running and immune to idle reclamation
    #[serde(default)]
    pub always_on: Vec<String>,

    /// Image containers for this repository are created from
    pub docker_image: String,

    /// Path probed on the published port to decide availability
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_idle_shutdown() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_serve() -> String {
    ":8080".to_string()
}

fn default_docker_address() -> String {
    "localhost".to_string()
}

fn default_health_check_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Look up a repository section case-insensitively.
    pub fn get_repo(&self, org: &str, repo: &str) -> Option<&RepoConfig> {
        let wanted = format!("{}/{}", org.to_lowercase(), repo.to_lowercase());
        self.repository
            .iter()
            .find(|(name, _)| name.to_lowercase() == wanted)
            .map(|(_, r)| r)
    }

    /// Whether a branch is configured always-on for its repository.
    pub fn is_always_on(&self, org: &str, repo: &str, branch: &str) -> bool {
        self.get_repo(org, repo)
            .map(|r| r.always_on.iter().any(|b| b == branch))
            .unwrap_or(false)
    }

    /// The "org/repo" pair marked default_repo, if any.
    pub fn default_repo(&self) -> Option<(String, String, &RepoConfig)> {
        self.repository
            .iter()
            .find(|(_, r)| r.default_repo)
            .and_then(|(name, r)| {
                let (org, repo) = name.split_once('/')?;
                Some((org.to_lowercase(), repo.to_lowercase(), r))
            })
    }

    /// Resolve the `serve` value to a bind address. A bare ":port" binds
    /// all interfaces.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let serve = if self.general.serve.starts_with(':') {
            format!("0.0.0.0{}", self.general.serve)
        } else {
            self.general.serve.clone()
        };
        serve
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid serve address '{}': {}", self.general.serve, e))
    }
}

/// Parse a duration string like "90s", "10m" or "1h". A bare number is
/// taken as seconds.
pub fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(num) = value.strip_suffix('h') {
        (num, 3600u64)
    } else if let Some(num) = value.strip_suffix('m') {
        (num, 60u64)
    } else if let Some(num) = value.strip_suffix('s') {
        (num, 1u64)
    } else {
        (value.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration: {}", value))?;

    Ok(Duration::from_secs(num * multiplier))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_duration(&value).map_err(serde::de::Error::custom)
}
