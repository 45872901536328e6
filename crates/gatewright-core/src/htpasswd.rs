//! Basic-auth credential store (`user:hash` lines) and the hashing utility
//! that produces the hashes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil::write_atomic;
use crate::tool::{ToolCommand, ToolError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hashing utility unavailable: {0}")]
    HasherUnavailable(#[source] ToolError),

    #[error("hashing utility failed: {0}")]
    Hasher(#[source] ToolError),

    #[error("hashing utility returned malformed output for user `{0}`")]
    MalformedHash(String),

    #[error("username `{0}` cannot contain ':' or line breaks")]
    InvalidUsername(String),
}

/// Salted adaptive one-way hashing, provided by an external utility.
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    /// Make sure the utility can be invoked, installing it if necessary.
    async fn ensure_available(&self) -> Result<(), StoreError>;

    /// Hash `password` for `username`, returning only the hash part.
    async fn hash(&self, username: &str, password: &str) -> Result<String, StoreError>;

    /// Whether the entry for `username` in the store at `path` accepts
    /// `password`.
    async fn verify(&self, path: &Path, username: &str, password: &str) -> Result<bool, StoreError>;
}

/// `htpasswd` from Apache utils, bcrypt mode.
pub struct HtpasswdTool {
    pub program: String,
    /// Command used to install the utility when it is missing. `None`
    /// disables on-demand installation.
    pub install: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

impl Default for HtpasswdTool {
    fn default() -> Self {
        Self {
            program: "htpasswd".into(),
            install: Some(
                ["apt-get", "install", "-y", "apache2-utils"]
                    .map(String::from)
                    .to_vec(),
            ),
            timeout: None,
        }
    }
}

impl HtpasswdTool {
    async fn locate(&self) -> Result<(), ToolError> {
        // `htpasswd` with no args prints usage and exits non-zero; only a
        // spawn failure means the program is missing.
        ToolCommand::new(&self.program)
            .timeout(self.timeout)
            .output()
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PasswordHasher for HtpasswdTool {
    async fn ensure_available(&self) -> Result<(), StoreError> {
        match self.locate().await {
            Ok(()) => return Ok(()),
            Err(ToolError::NotFound { .. }) => {}
            Err(e) => return Err(StoreError::HasherUnavailable(e)),
        }

        let Some(install) = self.install.as_ref().filter(|c| !c.is_empty()) else {
            return Err(StoreError::HasherUnavailable(ToolError::NotFound {
                program: self.program.clone(),
            }));
        };

        warn!(program = %self.program, install = ?install, "hashing utility missing, installing");
        ToolCommand::new(&install[0])
            .args(&install[1..])
            .timeout(self.timeout)
            .run()
            .await
            .map_err(StoreError::HasherUnavailable)?;

        self.locate().await.map_err(StoreError::HasherUnavailable)
    }

    async fn hash(&self, username: &str, password: &str) -> Result<String, StoreError> {
        let out = ToolCommand::new(&self.program)
            .args(["-n", "-i", "-B", username])
            .stdin(password)
            .timeout(self.timeout)
            .run()
            .await
            .map_err(StoreError::Hasher)?;

        let line = out.stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        line.strip_prefix(username)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| StoreError::MalformedHash(username.to_owned()))
    }

    async fn verify(&self, path: &Path, username: &str, password: &str) -> Result<bool, StoreError> {
        let out = ToolCommand::new(&self.program)
            .arg("-v")
            .arg("-i")
            .arg(path.as_os_str())
            .arg(username)
            .stdin(password)
            .timeout(self.timeout)
            .output()
            .await
            .map_err(StoreError::Hasher)?;
        Ok(out.status.success())
    }
}

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreChange {
    Unchanged,
    Added,
    Updated,
}

/// The on-disk `user:hash` file read by the proxy's basic auth.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Hash currently stored for `username`, if any.
    pub fn lookup(&self, username: &str) -> Result<Option<String>, StoreError> {
        let content = self.read()?;
        Ok(find_entry(&content, username).map(str::to_owned))
    }

    /// Create or update the entry for `username`. An entry that already
    /// accepts `password` is left alone; other users' lines are never touched.
    pub async fn upsert(
        &self,
        hasher: &dyn PasswordHasher,
        username: &str,
        password: &str,
    ) -> Result<StoreChange, StoreError> {
        if username.is_empty() || username.contains(&[':', '\n', '\r'][..]) {
            return Err(StoreError::InvalidUsername(username.to_owned()));
        }

        hasher.ensure_available().await?;

        let content = self.read()?;
        let existing = find_entry(&content, username).is_some();
        if existing && hasher.verify(&self.path, username, password).await? {
            debug!(username, path = %self.path.display(), "credential entry already current");
            return Ok(StoreChange::Unchanged);
        }

        let hash = hasher.hash(username, password).await?;
        let (updated, change) = upsert_line(&content, username, &hash);

        write_atomic(&self.path, updated.as_bytes(), Some(0o644)).map_err(|source| {
            StoreError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        info!(username, path = %self.path.display(), ?change, "credential store updated");
        Ok(change)
    }
}

fn find_entry<'a>(content: &'a str, username: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let (user, hash) = line.split_once(':')?;
        (user == username).then_some(hash)
    })
}

/// Replace the first line for `username` or append a new one. Every other
/// line, including its line ending, is carried over unchanged.
fn upsert_line(content: &str, username: &str, hash: &str) -> (String, StoreChange) {
    let entry = format!("{username}:{hash}");
    let mut out = String::with_capacity(content.len() + entry.len() + 1);
    let mut replaced = false;

    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(&['\n', '\r'][..]);
        let matches = !replaced
            && body
                .split_once(':')
                .is_some_and(|(user, _)| user == username);
        if matches {
            out.push_str(&entry);
            out.push_str(&line[body.len()..]);
            replaced = true;
        } else {
            out.push_str(line);
        }
    }

    if replaced {
        return (out, StoreChange::Updated);
    }

    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry);
    out.push('\n');
    (out, StoreChange::Added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_to_empty_store() {
        let (out, change) = upsert_line("", "user", "$2y$05$abc");
        assert_eq!(out, "user:$2y$05$abc\n");
        assert_eq!(change, StoreChange::Added);
    }

    #[test]
    fn replace_keeps_other_users_byte_for_byte() {
        let before = "alice:$apr1$x\r\nuser:old\nbob:{SHA}y";
        let (out, change) = upsert_line(before, "user", "new");
        assert_eq!(out, "alice:$apr1$x\r\nuser:new\nbob:{SHA}y");
        assert_eq!(change, StoreChange::Updated);
    }

    #[test]
    fn append_adds_missing_trailing_newline() {
        let (out, _) = upsert_line("alice:x", "user", "h");
        assert_eq!(out, "alice:x\nuser:h\n");
    }

    #[test]
    fn username_prefix_is_not_a_match() {
        let (out, change) = upsert_line("username:x\n", "user", "h");
        assert_eq!(out, "username:x\nuser:h\n");
        assert_eq!(change, StoreChange::Added);
    }

    #[test]
    fn lookup_reads_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".htpasswd");
        std::fs::write(&path, "a:1\nuser:2\n").unwrap();
        let store = CredentialStore::new(&path);
        assert_eq!(store.lookup("user").unwrap().as_deref(), Some("2"));
        assert_eq!(store.lookup("nobody").unwrap(), None);
    }

    #[test]
    fn lookup_on_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join(".htpasswd"));
        assert_eq!(store.lookup("user").unwrap(), None);
    }

    /// Stores `plain$<password>`.
    struct Plain;

    #[async_trait]
    impl PasswordHasher for Plain {
        async fn ensure_available(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn hash(&self, _username: &str, password: &str) -> Result<String, StoreError> {
            Ok(format!("plain${password}"))
        }

        async fn verify(&self, path: &Path, username: &str, password: &str) -> Result<bool, StoreError> {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            Ok(find_entry(&content, username) == Some(&*format!("plain${password}")))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upsert_keeps_store_readable_by_the_proxy() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();

        let fresh = CredentialStore::new(dir.path().join("fresh"));
        fresh.upsert(&Plain, "user", "pw").await.unwrap();
        let mode = std::fs::metadata(fresh.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        let shared_path = dir.path().join("shared");
        std::fs::write(&shared_path, "other:x\n").unwrap();
        std::fs::set_permissions(&shared_path, std::fs::Permissions::from_mode(0o664)).unwrap();
        let shared = CredentialStore::new(&shared_path);
        assert_eq!(shared.upsert(&Plain, "user", "pw").await.unwrap(), StoreChange::Added);
        let mode = std::fs::metadata(&shared_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
        assert_eq!(
            std::fs::read_to_string(&shared_path).unwrap(),
            "other:x\nuser:plain$pw\n"
        );
    }

    #[tokio::test]
    async fn missing_utility_without_installer_is_unavailable() {
        let tool = HtpasswdTool {
            program: "gatewright-no-such-binary".into(),
            install: None,
            timeout: None,
        };
        let err = tool.ensure_available().await.unwrap_err();
        assert!(
            matches!(err, StoreError::HasherUnavailable(ToolError::NotFound { .. })),
            "{err}"
        );
    }
}
