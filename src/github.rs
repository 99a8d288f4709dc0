//! GitHub integration
//!
//! A thin client over the GitHub REST API plus webhook payload handling:
//! reference resolution, commit statuses, and HMAC-SHA1 signature
//! validation for webhook deliveries.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{info, warn};

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the HMAC-SHA1 payload signature on webhook deliveries
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
/// Header naming the delivered event type
pub const EVENT_HEADER: &str = "X-GitHub-Event";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Commit status states reported back after webhook events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

/// An open pull request's head, as much of it as the router cares about
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub state: String,
    pub head: PullRequestHead,
}

/// GitHub push event payload (the fields the router consumes)
#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub after: String,
    pub repository: Repository,
    pub deleted: Option<bool>,
}

impl PushEvent {
    /// Whether this push deleted the branch rather than advancing it.
    pub fn is_branch_deletion(&self) -> bool {
        self.deleted.unwrap_or(false) || self.after.chars().all(|c| c == '0')
    }
}

/// GitHub pull request event payload
#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub repository: Repository,
    pub pull_request: PullRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

impl Repository {
    /// Split "org/repo" into its parts.
    pub fn org_repo(&self) -> Option<(&str, &str)> {
        self.full_name.split_once('/')
    }
}

/// Extract a branch name from a ref like "refs/heads/main".
pub fn branch_from_ref(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

/// Client for the GitHub REST API and webhook validation
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    secret: String,
    api_base: String,
}

impl GithubClient {
    pub fn new(token: &str, secret: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client with static configuration");

        Self {
            http,
            token: token.to_string(),
            secret: secret.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point the client at a different API base URL.
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Resolve a branch to its current head commit SHA.
    pub async fn get_reference(&self, org: &str, repo: &str, branch: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct RefObject {
            sha: String,
        }
        #[derive(Deserialize)]
        struct Reference {
            object: RefObject,
        }

        let url = format!(
            "{}/repos/{}/{}/git/ref/heads/{}",
            self.api_base,
            org,
            repo,
            urlencoding::encode(branch)
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to resolve reference")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {} resolving {}/{}#{}: {}", status, org, repo, branch, text);
        }

        let reference: Reference = response
            .json()
            .await
            .context("Failed to parse reference response")?;

        Ok(reference.object.sha)
    }

    /// Post a commit status linking back to the routed app URL.
    pub async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &str,
        state: StatusState,
        target_url: &str,
    ) -> Result<()> {
        let url = format!("{}/repos/{}/{}/statuses/{}", self.api_base, org, repo, sha);

        let body = serde_json::json!({
            "state": state.as_str(),
            "target_url": target_url,
            "description": "Branch instance",
            "context": "branchgate/instance",
        });

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", USER_AGENT)
            .json(&body)
            .send()
            .await
            .context("Failed to send commit status")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {}: {}", status, text);
        }

        info!(org, repo, sha, state = state.as_str(), "Commit status posted");
        Ok(())
    }

    /// Verify an X-Hub-Signature header against the shared secret.
    /// GitHub signs the raw payload with HMAC-SHA1: `sha1=<hex>`.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        let expected_prefix = "sha1=";
        if !signature.starts_with(expected_prefix) {
            warn!("Invalid signature format");
            return false;
        }
        let provided = &signature[expected_prefix.len()..];

        let mut mac = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => {
                warn!(error = %e, "Signature verification error");
                return false;
            }
        };
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        constant_time_compare(&expected, provided)
    }
}

/// Compute the X-Hub-Signature value for a payload. The counterpart of
/// [`GithubClient::verify_signature`], used by tests and tooling.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
