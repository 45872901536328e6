use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

// ── Recognized keys ───────────────────────────────────────────────────────────

pub const NETDATA_USER: &str = "NETDATA_USER";
pub const NETDATA_PASS: &str = "NETDATA_PASS";
pub const ADMIN_USER: &str = "ADMIN_USER";
pub const ADMIN_PASS: &str = "ADMIN_PASS";
pub const LETSENCRYPT_EMAIL: &str = "LETSENCRYPT_EMAIL";
pub const CERTBOT_EMAIL: &str = "CERTBOT_EMAIL";
pub const NETDATA_BASE: &str = "NETDATA_BASE";
pub const APP_PORT: &str = "PORT";
pub const APP_UPSTREAM: &str = "APP_UPSTREAM";

pub const DEFAULT_NETDATA_BASE: &str = "http://127.0.0.1:19999";
pub const DEFAULT_APP_PORT: &str = "6969";

/// Contact keys, first present non-blank value wins.
pub const CONTACT_KEYS: &[&str] = &[LETSENCRYPT_EMAIL, CERTBOT_EMAIL];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("read env file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// Immutable name → value mapping loaded once per run.
///
/// Keys are case-sensitive. A key that is present with an empty value is kept
/// as `Some("")`, distinct from an absent key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMap {
    vars: BTreeMap<String, String>,
}

impl EnvironmentMap {
    /// Parse a `KEY=value` file. The process environment is never modified.
    /// Single-quoted values are taken literally; `$NAME` in unquoted or
    /// double-quoted values is expanded following dotenv rules. A missing
    /// file yields an empty map.
    pub fn load(path: &Path) -> Result<Self, EnvError> {
        if !path.exists() {
            warn!(path = %path.display(), "env file not found, continuing with an empty environment");
            return Ok(Self::default());
        }

        let iter = dotenvy::from_path_iter(path).map_err(|source| EnvError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut vars = BTreeMap::new();
        for item in iter {
            let (k, v) = item.map_err(|source| EnvError::Read {
                path: path.display().to_string(),
                source,
            })?;
            vars.insert(k, v);
        }
        debug!(path = %path.display(), keys = vars.len(), "loaded env file");
        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Value for `key` if present and not blank.
    pub fn non_blank(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    /// First non-blank value among `keys`, in order.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.non_blank(k))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for EnvironmentMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
