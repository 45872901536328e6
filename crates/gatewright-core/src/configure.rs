//! Re-runnable `.env` writer: defaults, then existing values, then explicit
//! overrides.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::env;
use crate::fsutil::write_atomic;

/// Known keys in output order, with their defaults. Credentials have no
/// default: an unset pair keeps basic auth off.
pub const KNOWN_KEYS: &[(&str, Option<&str>)] = &[
    (env::ADMIN_USER, None),
    (env::ADMIN_PASS, None),
    (env::NETDATA_USER, None),
    (env::NETDATA_PASS, None),
    (env::APP_PORT, Some(env::DEFAULT_APP_PORT)),
    (env::APP_UPSTREAM, None),
    (env::NETDATA_BASE, Some(env::DEFAULT_NETDATA_BASE)),
    (env::LETSENCRYPT_EMAIL, None),
];

/// Parse `KEY=VALUE` as given on the command line.
pub fn parse_assignment(s: &str) -> Result<(String, String)> {
    let Some((key, value)) = s.split_once('=') else {
        bail!("expected KEY=VALUE, got `{s}`");
    };
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid key `{key}`");
    }
    if value.contains(&['\n', '\r'][..]) {
        bail!("value for `{key}` must be a single line");
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Merge and return the ordered entries that would be written.
pub fn merge(
    existing: &[(String, String)],
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let lookup = |key: &str| {
        overrides
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .or_else(|| existing.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone())
    };

    let mut out = Vec::new();
    for (key, default) in KNOWN_KEYS {
        if let Some(v) = lookup(*key).or_else(|| default.map(str::to_owned)) {
            out.push(((*key).to_owned(), v));
        }
    }

    let known = |k: &str| KNOWN_KEYS.iter().any(|(key, _)| *key == k);
    for (k, _) in existing.iter().chain(overrides) {
        if !known(k.as_str()) && !out.iter().any(|(o, _)| o == k) {
            if let Some(v) = lookup(k.as_str()) {
                out.push((k.clone(), v));
            }
        }
    }
    out
}

/// Characters that survive dotenv parsing unquoted: no expansion, escapes,
/// comments or whitespace.
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '@' | '+' | ',' | '%')
}

/// One value in a form that loads back byte for byte. Single quotes are
/// literal; a value that itself holds `'` falls back to double quotes with
/// `\`, `"` and `$` escaped.
fn render_value(v: &str) -> String {
    if v.chars().all(is_plain) {
        v.to_owned()
    } else if !v.contains('\'') {
        format!("'{v}'")
    } else {
        let escaped = v
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$");
        format!("\"{escaped}\"")
    }
}

fn render(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{k}={}\n", render_value(v)))
        .collect()
}

fn read_existing(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    dotenvy::from_path_iter(path)
        .with_context(|| format!("read {}", path.display()))?
        .map(|item| item.with_context(|| format!("parse {}", path.display())))
        .collect()
}

/// Write the merged env file. Returns the number of keys written.
pub fn write_env_file(path: &Path, overrides: &[(String, String)]) -> Result<usize> {
    let existing = read_existing(path)?;
    let entries = merge(&existing, overrides);
    write_atomic(path, render(&entries).as_bytes(), Some(0o600))
        .with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), keys = entries.len(), "env file written");
    Ok(entries.len())
}
