//! Server documents and the synthesizer that writes them.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::{ensure_symlink, remove_if_exists, write_atomic};
use crate::layout::{CertPaths, Layout};
use crate::patch::Directive;
use crate::route::{render_route, RouteSpec};

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub port: u16,
    pub tls: bool,
}

/// A route either rendered in place or pulled in from a shared snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteEntry {
    Inline(RouteSpec),
    Include { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDocument {
    pub listener: Listener,
    pub server_names: Vec<String>,
    pub routes: Vec<RouteEntry>,
    pub cert_paths: Option<CertPaths>,
}

impl ServerDocument {
    /// `tls` only takes effect together with certificate material.
    pub fn effective_tls(&self) -> bool {
        self.listener.tls && self.cert_paths.is_some()
    }

    pub fn render(&self) -> String {
        let tls = self.effective_tls();
        let port = self.listener.port;
        let flag = if tls { " ssl" } else { "" };

        let mut out = String::from("server {\n");
        let _ = writeln!(out, "    listen {port}{flag};");
        let _ = writeln!(out, "    listen [::]:{port}{flag};");
        let _ = writeln!(out, "    server_name {};", self.server_names.join(" "));

        for entry in &self.routes {
            if let RouteEntry::Include { path } = entry {
                let _ = writeln!(out, "    include {};", path.display());
            }
        }

        if let (true, Some(certs)) = (tls, &self.cert_paths) {
            out.push('\n');
            let _ = writeln!(out, "    ssl_certificate {};", certs.fullchain.display());
            let _ = writeln!(out, "    ssl_certificate_key {};", certs.privkey.display());
        }

        for entry in &self.routes {
            if let RouteEntry::Inline(spec) = entry {
                out.push('\n');
                out.push_str(&indent(&render_route(spec), "    "));
            }
        }

        out.push_str("}\n");
        out
    }
}

fn indent(text: &str, pad: &str) -> String {
    text.lines()
        .map(|l| {
            if l.is_empty() {
                "\n".to_owned()
            } else {
                format!("{pad}{l}\n")
            }
        })
        .collect()
}

/// `domain` plus its `www.` alias.
pub fn server_names(domain: &str) -> Vec<String> {
    let bare = domain.strip_prefix("www.").unwrap_or(domain);
    vec![bare.to_owned(), format!("www.{bare}")]
}

// ── Site plan ─────────────────────────────────────────────────────────────────

/// Everything the synthesizer needs for one domain.
#[derive(Debug, Clone)]
pub struct SiteInputs {
    pub domain: String,
    pub monitor: RouteSpec,
    pub app: RouteSpec,
    /// Render the monitoring route once into a snippet included by every
    /// server document.
    pub shared_snippet: bool,
    pub certs: Option<CertPaths>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snippet {
    pub path: PathBuf,
    pub content: String,
}

/// The rendered artifacts for one domain.
#[derive(Debug, Clone, Serialize)]
pub struct SitePlan {
    pub domain: String,
    pub documents: Vec<ServerDocument>,
    pub snippet: Option<Snippet>,
    monitor: RouteSpec,
}

impl SitePlan {
    pub fn build(inputs: &SiteInputs, layout: &Layout) -> Self {
        let snippet = inputs.shared_snippet.then(|| Snippet {
            path: layout.snippet_file(),
            content: render_route(&inputs.monitor),
        });

        let monitor_entry = match &snippet {
            Some(s) => RouteEntry::Include {
                path: s.path.clone(),
            },
            None => RouteEntry::Inline(inputs.monitor.clone()),
        };
        let routes = vec![monitor_entry, RouteEntry::Inline(inputs.app.clone())];

        let mut documents = vec![ServerDocument {
            listener: Listener {
                port: HTTP_PORT,
                tls: false,
            },
            server_names: server_names(&inputs.domain),
            routes: routes.clone(),
            cert_paths: None,
        }];

        // Without certificate material the secured document would only
        // duplicate the plain one.
        if let Some(certs) = &inputs.certs {
            documents.push(ServerDocument {
                listener: Listener {
                    port: HTTPS_PORT,
                    tls: true,
                },
                server_names: server_names(&inputs.domain),
                routes,
                cert_paths: Some(certs.clone()),
            });
        }

        Self {
            domain: inputs.domain.clone(),
            documents,
            snippet,
            monitor: inputs.monitor.clone(),
        }
    }

    pub fn has_tls(&self) -> bool {
        self.documents.iter().any(ServerDocument::effective_tls)
    }

    /// Full text of the site file.
    pub fn render_site(&self) -> String {
        let mut out = format!(
            "# Managed by gatewright for {}. Rewritten on every run; the\n\
             # certificate tool may add its own directives below.\n",
            self.domain
        );
        for doc in &self.documents {
            out.push('\n');
            out.push_str(&doc.render());
        }
        out
    }

    /// What the patcher must find in the secured block for the monitoring
    /// route to be served there.
    pub fn monitor_directive(&self) -> Directive {
        match &self.snippet {
            Some(s) => Directive::include(&s.path),
            None => Directive::block(self.monitor.location_head(), render_route(&self.monitor)),
        }
    }
}

// ── Synthesizer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteSummary {
    pub site_file: PathBuf,
    pub snippet_file: Option<PathBuf>,
    pub linked: bool,
    pub removed_default: bool,
}

pub struct Synthesizer<'a> {
    layout: &'a Layout,
}

impl<'a> Synthesizer<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Write the snippet and site file wholesale, link the site into the
    /// active set and drop the stock default site.
    pub fn write(&self, plan: &SitePlan) -> Result<WriteSummary, SynthError> {
        let mut summary = WriteSummary::default();

        if let Some(snippet) = &plan.snippet {
            write_file(&snippet.path, &snippet.content)?;
            summary.snippet_file = Some(snippet.path.clone());
        }

        let site = self.layout.site_file(&plan.domain);
        write_file(&site, &plan.render_site())?;
        info!(path = %site.display(), documents = plan.documents.len(), "site file written");
        summary.site_file = site.clone();

        let link = self.layout.site_link(&plan.domain);
        summary.linked = ensure_symlink(&site, &link).map_err(|source| SynthError::Write {
            path: link.clone(),
            source,
        })?;
        if summary.linked {
            info!(link = %link.display(), "site enabled");
        }

        let default = self.layout.default_site_link();
        summary.removed_default =
            remove_if_exists(&default).map_err(|source| SynthError::Write {
                path: default.clone(),
                source,
            })?;
        if summary.removed_default {
            info!(path = %default.display(), "removed default site from the active set");
        }

        Ok(summary)
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), SynthError> {
    debug!(path = %path.display(), bytes = content.len(), "writing");
    write_atomic(path, content.as_bytes(), None).map_err(|source| SynthError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{BasicAuth, PrefixMode};

    fn inputs(shared_snippet: bool, certs: Option<CertPaths>) -> SiteInputs {
        SiteInputs {
            domain: "example.com".into(),
            monitor: RouteSpec::monitor(
                "127.0.0.1:19999".parse().unwrap(),
                PrefixMode::StripPrefix,
                Some(BasicAuth {
                    realm: "Netdata".into(),
                    user_file: "/etc/nginx/.htpasswd".into(),
                }),
            ),
            app: RouteSpec::catch_all("127.0.0.1:6969".parse().unwrap()),
            shared_snippet,
            certs,
        }
    }

    fn certs() -> CertPaths {
        Layout::default().cert_paths("example.com")
    }

    #[test]
    fn http_only_without_certs() {
        let plan = SitePlan::build(&inputs(true, None), &Layout::default());
        assert_eq!(plan.documents.len(), 1);
        assert!(!plan.has_tls());
        let site = plan.render_site();
        assert!(site.contains("    listen 80;\n"));
        assert!(!site.contains("ssl_certificate"));
        assert!(!site.contains("443"));
    }

    #[test]
    fn both_listeners_include_the_same_snippet() {
        let plan = SitePlan::build(&inputs(true, Some(certs())), &Layout::default());
        assert_eq!(plan.documents.len(), 2);
        let site = plan.render_site();
        let include = "    include /etc/nginx/snippets/gatewright-netdata.conf;\n";
        assert_eq!(site.matches(include).count(), 2);
        assert!(!site.contains("location /netdata/"));
        assert!(site.contains("    listen 443 ssl;\n"));
        assert!(site.contains(
            "    ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;\n"
        ));
        let snippet = plan.snippet.as_ref().unwrap();
        assert!(snippet.content.contains("auth_basic_user_file /etc/nginx/.htpasswd;"));
    }

    #[test]
    fn include_follows_server_name() {
        let plan = SitePlan::build(&inputs(true, None), &Layout::default());
        let doc = plan.documents[0].render();
        let lines: Vec<_> = doc.lines().collect();
        let name = lines.iter().position(|l| l.contains("server_name")).unwrap();
        assert!(lines[name + 1].trim_start().starts_with("include "));
    }

    #[test]
    fn inline_variant_renders_route_in_every_document() {
        let plan = SitePlan::build(&inputs(false, Some(certs())), &Layout::default());
        assert!(plan.snippet.is_none());
        let site = plan.render_site();
        assert_eq!(site.matches("    location /netdata/ {\n").count(), 2);
        assert_eq!(site.matches("    location / {\n").count(), 2);
    }

    #[test]
    fn tls_without_certs_degrades() {
        let doc = ServerDocument {
            listener: Listener {
                port: HTTPS_PORT,
                tls: true,
            },
            server_names: server_names("example.com"),
            routes: vec![],
            cert_paths: None,
        };
        assert!(!doc.effective_tls());
        let text = doc.render();
        assert!(!text.contains("ssl"));
    }

    #[test]
    fn server_names_add_www_alias() {
        assert_eq!(server_names("example.com"), ["example.com", "www.example.com"]);
        assert_eq!(server_names("www.example.com"), ["example.com", "www.example.com"]);
    }

    #[test]
    fn write_replaces_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(&dir.path().join("nginx"), &dir.path().join("le"));
        std::fs::create_dir_all(&layout.sites_enabled).unwrap();
        std::fs::write(layout.default_site_link(), "stock").unwrap();
        std::fs::create_dir_all(&layout.sites_available).unwrap();
        std::fs::write(layout.site_file("example.com"), "old content").unwrap();

        let plan = SitePlan::build(&inputs(true, None), &layout);
        let summary = Synthesizer::new(&layout).write(&plan).unwrap();

        assert!(summary.linked);
        assert!(summary.removed_default);
        assert_eq!(
            std::fs::read_to_string(layout.site_file("example.com")).unwrap(),
            plan.render_site()
        );
        assert_eq!(
            std::fs::read_link(layout.site_link("example.com")).unwrap(),
            layout.site_file("example.com")
        );
        assert!(layout.snippet_file().is_file());

        let again = Synthesizer::new(&layout).write(&plan).unwrap();
        assert!(!again.linked);
        assert!(!again.removed_default);
    }
}
