use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::env::{self, EnvironmentMap};

/// A candidate pair of environment keys holding a username and a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub user: &'static str,
    pub pass: &'static str,
}

/// Default preference cascade: the monitoring-specific pair, then the app's
/// admin login. Adding a fallback is a matter of appending here.
pub const DEFAULT_CASCADE: &[KeyPair] = &[
    KeyPair {
        user: env::NETDATA_USER,
        pass: env::NETDATA_PASS,
    },
    KeyPair {
        user: env::ADMIN_USER,
        pass: env::ADMIN_PASS,
    },
];

/// Why a candidate pair did not satisfy the cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PairSkip {
    Absent { key: String },
    Blank { key: String },
}

/// Credentials picked by the resolver. The password never leaves this struct
/// except on its way to the hashing utility.
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
    pub source: KeyPair,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of the credential cascade.
#[derive(Debug)]
pub struct Resolution {
    pub credentials: Option<Credentials>,
    pub skipped: Vec<PairSkip>,
}

/// Auth decision handed to the renderer. `secret_ref` points into the
/// credential store and is only set once an entry has been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialDecision {
    pub enabled: bool,
    pub username: Option<String>,
    pub secret_ref: Option<PathBuf>,
}

impl CredentialDecision {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            username: None,
            secret_ref: None,
        }
    }

    pub fn enabled(username: impl Into<String>, store: &Path) -> Self {
        Self {
            enabled: true,
            username: Some(username.into()),
            secret_ref: Some(store.to_path_buf()),
        }
    }
}

/// Walk `cascade` in order; the first pair with both halves present and
/// non-blank wins.
pub fn resolve(env: &EnvironmentMap, cascade: &[KeyPair]) -> Resolution {
    let mut skipped = Vec::new();

    for pair in cascade {
        let user = check(env, pair.user);
        let pass = check(env, pair.pass);
        match (user, pass) {
            (Ok(user), Ok(pass)) => {
                info!(username = %user, source = pair.user, "auth credentials resolved");
                return Resolution {
                    credentials: Some(Credentials {
                        username: user.to_owned(),
                        password: Zeroizing::new(pass.to_owned()),
                        source: *pair,
                    }),
                    skipped,
                };
            }
            (user, pass) => {
                for skip in [user.err(), pass.err()].into_iter().flatten() {
                    if let PairSkip::Blank { key } = &skip {
                        warn!(key = %key, "auth variable is set but empty, ignoring pair");
                    }
                    skipped.push(skip);
                }
            }
        }
    }

    info!("no complete auth pair configured, basic auth disabled");
    Resolution {
        credentials: None,
        skipped,
    }
}

fn check<'a>(env: &'a EnvironmentMap, key: &str) -> Result<&'a str, PairSkip> {
    match env.get(key) {
        None => Err(PairSkip::Absent { key: key.to_owned() }),
        Some(v) if v.trim().is_empty() => Err(PairSkip::Blank { key: key.to_owned() }),
        Some(v) => Ok(v),
    }
}
