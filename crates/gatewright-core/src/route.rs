//! Location blocks for the proxied routes.
//!
//! Rendering is a pure function of a [`RouteSpec`]: same input, same bytes.
//! The auth section always occupies the same two lines whether basic auth is
//! on or off, so rendered output only differs where the decision differs.

use std::fmt::{self, Write as _};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path prefix the monitoring dashboard is served under.
pub const MONITOR_PREFIX: &str = "/netdata/";
pub const MONITOR_REALM: &str = "Netdata";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid upstream `{input}`: {reason}")]
    InvalidUpstream { input: String, reason: &'static str },

    #[error("unknown routing strategy `{0}` (expected strip-prefix, rewrite-body or pass-through)")]
    UnknownStrategy(String),
}

// ── Upstream address ──────────────────────────────────────────────────────────

/// A validated `host:port` upstream, without scheme or path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, RouteError> {
        let host = host.into();
        Self::from_str(&format!("{}:{port}", bracket(&host)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept `http://host:port` (optionally with a bare trailing slash) as
    /// well as `host:port`. Any other scheme or a path is rejected.
    pub fn from_base_url(input: &str) -> Result<Self, RouteError> {
        let trimmed = input.trim();
        let rest = match trimmed.split_once("://") {
            Some(("http", rest)) => rest,
            Some(_) => return Err(invalid(input, "only http:// upstreams are supported")),
            None => trimmed,
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        rest.parse().map_err(|e| match e {
            RouteError::InvalidUpstream { reason, .. } => invalid(input, reason),
            other => other,
        })
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}

fn invalid(input: &str, reason: &'static str) -> RouteError {
    RouteError::InvalidUpstream {
        input: input.to_owned(),
        reason,
    }
}

impl FromStr for HostPort {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(|c| c.is_whitespace()) {
            return Err(invalid(s, "must be non-empty and contain no whitespace"));
        }
        if s.contains("://") || s.contains('/') {
            return Err(invalid(s, "expected host:port without scheme or path"));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(s, "unterminated IPv6 literal"))?;
            addr.parse::<Ipv6Addr>()
                .map_err(|_| invalid(s, "invalid IPv6 literal"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid(s, "missing port"))?;
            (format!("[{addr}]"), port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid(s, "missing port"))?;
            if host.is_empty() {
                return Err(invalid(s, "missing host"));
            }
            if !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            {
                return Err(invalid(s, "host contains unsupported characters"));
            }
            (host.to_owned(), port)
        };

        let port: u16 = port.parse().map_err(|_| invalid(s, "port is not a number"))?;
        if port == 0 {
            return Err(invalid(s, "port must be non-zero"));
        }
        Ok(Self { host, port })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<HostPort> for String {
    fn from(hp: HostPort) -> Self {
        hp.to_string()
    }
}

// ── Route spec ────────────────────────────────────────────────────────────────

/// How a non-root prefix reaches the upstream. Exactly one per route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefixMode {
    /// Proxy to the upstream root; the trailing slash on `proxy_pass` drops
    /// the matched prefix.
    #[default]
    StripPrefix,
    /// Keep the prefix upstream, disable upstream compression and rewrite
    /// root-relative references in response bodies.
    RewriteBody,
    /// Forward the path untouched. Used for the root catch-all.
    PassThrough,
}

impl FromStr for PrefixMode {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strip-prefix" => Ok(Self::StripPrefix),
            "rewrite-body" => Ok(Self::RewriteBody),
            "pass-through" => Ok(Self::PassThrough),
            other => Err(RouteError::UnknownStrategy(other.to_owned())),
        }
    }
}

impl fmt::Display for PrefixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StripPrefix => "strip-prefix",
            Self::RewriteBody => "rewrite-body",
            Self::PassThrough => "pass-through",
        })
    }
}

/// Basic-auth directive pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicAuth {
    pub realm: String,
    pub user_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    pub path_prefix: String,
    pub upstream: HostPort,
    pub mode: PrefixMode,
    pub auth: Option<BasicAuth>,
    /// Upstream streams or upgrades connections (websocket, SSE).
    pub upgrade: bool,
    pub extra_headers: Vec<(String, String)>,
}

impl RouteSpec {
    /// The monitoring dashboard route.
    pub fn monitor(upstream: HostPort, mode: PrefixMode, auth: Option<BasicAuth>) -> Self {
        Self {
            path_prefix: MONITOR_PREFIX.to_owned(),
            upstream,
            mode,
            auth,
            upgrade: true,
            extra_headers: Vec::new(),
        }
    }

    /// The application catch-all at `/`.
    pub fn catch_all(upstream: HostPort) -> Self {
        Self {
            path_prefix: "/".to_owned(),
            upstream,
            mode: PrefixMode::PassThrough,
            auth: None,
            upgrade: false,
            extra_headers: Vec::new(),
        }
    }

    pub fn strip_prefix(&self) -> bool {
        self.mode == PrefixMode::StripPrefix
    }

    pub fn is_root(&self) -> bool {
        self.path_prefix == "/"
    }

    /// The `location` head used to recognise this route in a config file.
    pub fn location_head(&self) -> String {
        format!("location {}", self.path_prefix)
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

const FORWARDING_HEADERS: &[(&str, &str)] = &[
    ("Host", "$host"),
    ("X-Real-IP", "$remote_addr"),
    ("X-Forwarded-For", "$proxy_add_x_forwarded_for"),
    ("X-Forwarded-Proto", "$scheme"),
];

const UPGRADE_HEADERS: &[(&str, &str)] = &[
    ("Upgrade", "$http_upgrade"),
    ("Connection", "\"upgrade\""),
];

const REWRITE_TYPES: &str = "text/css application/javascript application/json";

/// Render the full route: an exact-match redirect for non-root prefixes,
/// then the location block. Lines are unindented; callers indent.
pub fn render_route(spec: &RouteSpec) -> String {
    let mut out = String::new();

    if !spec.is_root() {
        let bare = spec.path_prefix.trim_end_matches('/');
        let _ = writeln!(out, "location = {bare} {{");
        let _ = writeln!(out, "    return 301 {};", spec.path_prefix);
        out.push_str("}\n\n");
    }

    let _ = writeln!(out, "{} {{", spec.location_head());
    render_auth(&mut out, spec.auth.as_ref());
    out.push('\n');

    let slash = if spec.strip_prefix() { "/" } else { "" };
    let pass = format!("http://{}{slash}", spec.upstream);
    let _ = writeln!(out, "    proxy_pass {pass};");
    out.push_str("    proxy_http_version 1.1;\n");

    for (name, value) in FORWARDING_HEADERS {
        let _ = writeln!(out, "    proxy_set_header {name} {value};");
    }
    if spec.upgrade {
        for (name, value) in UPGRADE_HEADERS {
            let _ = writeln!(out, "    proxy_set_header {name} {value};");
        }
        out.push_str("    proxy_buffering off;\n");
    }
    for (name, value) in &spec.extra_headers {
        let _ = writeln!(out, "    proxy_set_header {name} {};", quote(value));
    }

    if spec.mode == PrefixMode::RewriteBody {
        render_rewrites(&mut out, &spec.path_prefix);
    }

    out.push_str("}\n");
    out
}

fn render_auth(out: &mut String, auth: Option<&BasicAuth>) {
    match auth {
        Some(auth) => {
            let _ = writeln!(out, "    auth_basic {};", quoted(&auth.realm));
            let _ = writeln!(out, "    auth_basic_user_file {};", auth.user_file.display());
        }
        None => {
            out.push_str("    # auth_basic off; no credentials configured\n");
            out.push_str("    # auth_basic_user_file -;\n");
        }
    }
}

fn render_rewrites(out: &mut String, prefix: &str) {
    out.push('\n');
    out.push_str("    proxy_set_header Accept-Encoding \"\";\n");
    let _ = writeln!(out, "    sub_filter_types {REWRITE_TYPES};");
    out.push_str("    sub_filter_once off;\n");
    let _ = writeln!(
        out,
        "    sub_filter '<head>' '<head><base href=\"{prefix}\">';"
    );
    for attr in ["href=\"/", "src=\"/", "action=\"/"] {
        let rel = prefix.strip_prefix('/').unwrap_or(prefix);
        let _ = writeln!(out, "    sub_filter '{attr}' '{attr}{rel}';");
    }
    let _ = writeln!(out, "    sub_filter '\"/api/' '\"{prefix}api/';");
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == ';' || c == '{' || c == '}') {
        quoted(value)
    } else {
        value.to_owned()
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netdata() -> HostPort {
        "127.0.0.1:19999".parse().unwrap()
    }

    fn auth() -> BasicAuth {
        BasicAuth {
            realm: MONITOR_REALM.into(),
            user_file: PathBuf::from("/etc/nginx/.htpasswd"),
        }
    }

    #[test]
    fn host_port_accepts_common_forms() {
        assert_eq!(netdata().to_string(), "127.0.0.1:19999");
        assert_eq!("localhost:6969".parse::<HostPort>().unwrap().port(), 6969);
        assert_eq!("[::1]:19999".parse::<HostPort>().unwrap().host(), "[::1]");
        assert_eq!(HostPort::new("::1", 80).unwrap().to_string(), "[::1]:80");
    }

    #[test]
    fn host_port_rejects_bad_syntax() {
        for bad in [
            "",
            "127.0.0.1",
            "127.0.0.1:0",
            "127.0.0.1:99999",
            "http://127.0.0.1:80",
            "127.0.0.1:80/path",
            "bad host:80",
            ":80",
            "[::1:80",
            "[nope]:80",
            "host;evil:80",
        ] {
            assert!(bad.parse::<HostPort>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn base_url_accepts_http_and_bare() {
        assert_eq!(HostPort::from_base_url("http://127.0.0.1:19999").unwrap(), netdata());
        assert_eq!(HostPort::from_base_url("http://127.0.0.1:19999/").unwrap(), netdata());
        assert_eq!(HostPort::from_base_url("127.0.0.1:19999").unwrap(), netdata());
        assert!(HostPort::from_base_url("https://127.0.0.1:19999").is_err());
        assert!(HostPort::from_base_url("http://127.0.0.1:19999/netdata").is_err());
    }

    #[test]
    fn monitor_route_strip_prefix_with_auth() {
        let out = render_route(&RouteSpec::monitor(netdata(), PrefixMode::StripPrefix, Some(auth())));
        assert!(out.starts_with("location = /netdata {\n    return 301 /netdata/;\n}\n\n"));
        assert!(out.contains("location /netdata/ {\n    auth_basic \"Netdata\";\n"));
        assert!(out.contains("    auth_basic_user_file /etc/nginx/.htpasswd;\n"));
        assert!(out.contains("    proxy_pass http://127.0.0.1:19999/;\n"));
        assert!(out.contains("    proxy_set_header Upgrade $http_upgrade;\n"));
        assert!(out.contains("    proxy_set_header Connection \"upgrade\";\n"));
        assert!(!out.contains("sub_filter"));
    }

    #[test]
    fn auth_placeholder_keeps_shape() {
        let on = render_route(&RouteSpec::monitor(netdata(), PrefixMode::StripPrefix, Some(auth())));
        let off = render_route(&RouteSpec::monitor(netdata(), PrefixMode::StripPrefix, None));
        assert_eq!(on.lines().count(), off.lines().count());
        assert!(!off.lines().any(|l| l.trim_start().starts_with("auth_basic")));
        let differing: Vec<_> = on.lines().zip(off.lines()).filter(|(a, b)| a != b).collect();
        assert_eq!(differing.len(), 2);
    }

    #[test]
    fn forwarding_headers_are_unconditional() {
        let out = render_route(&RouteSpec::catch_all("127.0.0.1:6969".parse().unwrap()));
        for h in ["Host $host", "X-Real-IP $remote_addr", "X-Forwarded-For", "X-Forwarded-Proto $scheme"] {
            assert!(out.contains(h), "missing {h}");
        }
        assert!(!out.contains("Upgrade"));
        assert!(!out.contains("return 301"));
        assert!(out.contains("    proxy_pass http://127.0.0.1:6969;\n"));
    }

    #[test]
    fn rewrite_body_preserves_prefix_and_rewrites() {
        let out = render_route(&RouteSpec::monitor(netdata(), PrefixMode::RewriteBody, None));
        assert!(out.contains("    proxy_pass http://127.0.0.1:19999;\n"));
        assert!(out.contains("    proxy_set_header Accept-Encoding \"\";\n"));
        assert!(out.contains("    sub_filter 'href=\"/' 'href=\"/netdata/';\n"));
        assert!(out.contains("    sub_filter 'src=\"/' 'src=\"/netdata/';\n"));
        assert!(out.contains("    sub_filter_once off;\n"));
    }

    #[test]
    fn rewrite_body_tolerates_empty_prefix() {
        let mut spec = RouteSpec::monitor(netdata(), PrefixMode::RewriteBody, None);
        spec.path_prefix = String::new();
        let out = render_route(&spec);
        assert!(out.contains("    sub_filter 'href=\"/' 'href=\"/';\n"));
    }

    #[test]
    fn realm_is_always_quoted() {
        let mut custom = auth();
        custom.realm = "Ops \"team\"".into();
        let out = render_route(&RouteSpec::monitor(netdata(), PrefixMode::StripPrefix, Some(custom)));
        assert!(out.contains("    auth_basic \"Ops \\\"team\\\"\";\n"));
    }

    #[test]
    fn extra_headers_follow_in_order() {
        let mut spec = RouteSpec::catch_all("127.0.0.1:6969".parse().unwrap());
        spec.extra_headers = vec![
            ("X-A".into(), "1".into()),
            ("X-B".into(), "two words".into()),
        ];
        let out = render_route(&spec);
        let a = out.find("X-A 1;").unwrap();
        let b = out.find("X-B \"two words\";").unwrap();
        assert!(a < b);
    }

    #[test]
    fn rendering_is_deterministic() {
        let spec = RouteSpec::monitor(netdata(), PrefixMode::RewriteBody, Some(auth()));
        assert_eq!(render_route(&spec), render_route(&spec.clone()));
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("strip-prefix".parse::<PrefixMode>().unwrap(), PrefixMode::StripPrefix);
        assert_eq!("rewrite-body".parse::<PrefixMode>().unwrap(), PrefixMode::RewriteBody);
        assert!("both".parse::<PrefixMode>().is_err());
    }
}
