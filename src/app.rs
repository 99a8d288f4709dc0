//! Application identity
//!
//! An [`AppId`] names one deployable unit: a branch head of a repository.
//! The registry keys on the full `org.repo.branch.commit` form while the
//! container runtime keys on `org.repo.commit` alone, so two branches
//! pointing at the same commit share a single container.

use serde::Serialize;

/// Length of the abbreviated commit hash used everywhere in the router.
pub const COMMIT_LEN: usize = 7;

/// Identity of a deployable application: one branch head of one repository.
///
/// All segments are lowercase and contain neither `/` nor `.` so that the
/// dotted key and container-name forms parse back unambiguously. `branch`
/// is advisory and may be empty when a request arrived in commit form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AppId {
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub commit: String,
}

impl AppId {
    /// Build an AppId, normalizing every segment and abbreviating the
    /// commit hash. Normalization is idempotent: feeding an already
    /// canonical value back in produces the same AppId.
    pub fn new(org: &str, repo: &str, branch: &str, commit: &str) -> Self {
        let commit: String = sanitize(commit).chars().take(COMMIT_LEN).collect();
        Self {
            org: sanitize(org),
            repo: sanitize(repo),
            branch: sanitize(branch),
            commit,
        }
    }

    /// Registry key: `org.repo.branch.commit`.
    pub fn key(&self) -> String {
        format!("{}.{}.{}.{}", self.org, self.repo, self.branch, self.commit)
    }

    /// Container name: `org.repo.commit`. Two AppIds that differ only in
    /// branch map to the same container.
    pub fn container_name(&self) -> String {
        format!("{}.{}.{}", self.org, self.repo, self.commit)
    }

    /// Parse a registry key back into an AppId.
    pub fn from_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.len() != 4 {
            return None;
        }
        Some(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }

    /// Parse a container name (`org.repo.commit`) into an AppId with an
    /// empty branch. Names that do not split into at least three parts
    /// are not ours and yield `None`.
    pub fn from_container_name(name: &str) -> Option<Self> {
        let name = name.trim_start_matches('/');
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < 3 {
            return None;
        }
        Some(Self::new(parts[0], parts[1], "", parts[2]))
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Lowercase a segment and strip the two characters that would corrupt
/// the dotted key forms.
fn sanitize(segment: &str) -> String {
    segment
        .to_lowercase()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// Whether a path segment looks like an abbreviated or full commit hash
/// rather than a branch name: 7 to 40 lowercase hex characters.
pub fn looks_like_commit(segment: &str) -> bool {
    (COMMIT_LEN..=40).contains(&segment.len())
        && segment.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
