use std::path::{Path, PathBuf};

use serde::Serialize;

/// Certificate material for the secured listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertPaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

/// Where everything lives on the host.
#[derive(Debug, Clone)]
pub struct Layout {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    pub snippets: PathBuf,
    pub htpasswd: PathBuf,
    pub letsencrypt_live: PathBuf,
}

pub const SNIPPET_NAME: &str = "gatewright-netdata.conf";
pub const DEFAULT_SITE: &str = "default";

impl Default for Layout {
    fn default() -> Self {
        Self::new(Path::new("/etc/nginx"), Path::new("/etc/letsencrypt"))
    }
}

impl Layout {
    pub fn new(nginx_dir: &Path, letsencrypt_dir: &Path) -> Self {
        Self {
            sites_available: nginx_dir.join("sites-available"),
            sites_enabled: nginx_dir.join("sites-enabled"),
            snippets: nginx_dir.join("snippets"),
            htpasswd: nginx_dir.join(".htpasswd"),
            letsencrypt_live: letsencrypt_dir.join("live"),
        }
    }

    pub fn site_file(&self, domain: &str) -> PathBuf {
        self.sites_available.join(domain)
    }

    pub fn site_link(&self, domain: &str) -> PathBuf {
        self.sites_enabled.join(domain)
    }

    pub fn default_site_link(&self) -> PathBuf {
        self.sites_enabled.join(DEFAULT_SITE)
    }

    pub fn snippet_file(&self) -> PathBuf {
        self.snippets.join(SNIPPET_NAME)
    }

    pub fn cert_paths(&self, domain: &str) -> CertPaths {
        let dir = self.letsencrypt_live.join(domain);
        CertPaths {
            fullchain: dir.join("fullchain.pem"),
            privkey: dir.join("privkey.pem"),
        }
    }

    /// Certificate material for `domain`, only if both files exist.
    pub fn existing_certs(&self, domain: &str) -> Option<CertPaths> {
        let paths = self.cert_paths(domain);
        (paths.fullchain.is_file() && paths.privkey.is_file()).then_some(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let l = Layout::default();
        assert_eq!(l.site_file("example.com"), Path::new("/etc/nginx/sites-available/example.com"));
        assert_eq!(l.site_link("example.com"), Path::new("/etc/nginx/sites-enabled/example.com"));
        assert_eq!(l.snippet_file(), Path::new("/etc/nginx/snippets/gatewright-netdata.conf"));
        assert_eq!(
            l.cert_paths("example.com").privkey,
            Path::new("/etc/letsencrypt/live/example.com/privkey.pem")
        );
    }

    #[test]
    fn certs_require_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let l = Layout::new(&dir.path().join("nginx"), &dir.path().join("le"));
        let paths = l.cert_paths("example.com");
        std::fs::create_dir_all(paths.fullchain.parent().unwrap()).unwrap();
        std::fs::write(&paths.fullchain, "cert").unwrap();
        assert_eq!(l.existing_certs("example.com"), None);
        std::fs::write(&paths.privkey, "key").unwrap();
        assert_eq!(l.existing_certs("example.com"), Some(paths));
    }
}
