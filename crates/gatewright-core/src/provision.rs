//! The provisioning run: resolve credentials, synthesize the site, obtain
//! certificates, then patch whatever the certificate tool rewrote.

use tracing::debug;

use crate::certbot::{CertRequest, CertificateIssuer, IssueMode};
use crate::credentials::{self, CredentialDecision, KeyPair, DEFAULT_CASCADE};
use crate::daemon::ProxyDaemon;
use crate::env::{self, EnvironmentMap};
use crate::error::ProvisionError;
use crate::htpasswd::{CredentialStore, PasswordHasher};
use crate::layout::Layout;
use crate::patch::{PatchError, PatchOutcome, Patcher, Target};
use crate::report::{AuthStatus, PatchStatus, RunReport, TlsStatus};
use crate::route::{BasicAuth, HostPort, PrefixMode, RouteSpec, MONITOR_REALM};
use crate::vhost::{server_names, SiteInputs, SitePlan, Synthesizer, HTTPS_PORT};

/// Settings for one run. Nothing here is read from the process environment.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub layout: Layout,
    pub strategy: PrefixMode,
    pub shared_snippet: bool,
    pub issue_mode: IssueMode,
    pub skip_tls: bool,
    pub cascade: Vec<KeyPair>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            strategy: PrefixMode::StripPrefix,
            shared_snippet: true,
            issue_mode: IssueMode::Nginx,
            skip_tls: false,
            cascade: DEFAULT_CASCADE.to_vec(),
        }
    }
}

impl ProvisionConfig {
    fn inputs(
        &self,
        domain: &str,
        env: &EnvironmentMap,
        decision: &CredentialDecision,
    ) -> Result<SiteInputs, ProvisionError> {
        let (monitor, app) = upstreams(env)?;
        let auth = decision.secret_ref.as_ref().map(|path| BasicAuth {
            realm: MONITOR_REALM.to_owned(),
            user_file: path.clone(),
        });
        Ok(SiteInputs {
            domain: domain.to_owned(),
            monitor: RouteSpec::monitor(monitor, self.strategy, auth),
            app: RouteSpec::catch_all(app),
            shared_snippet: self.shared_snippet,
            certs: self.layout.existing_certs(domain),
        })
    }

    /// The site as it would be written, without touching anything or
    /// calling any external tool.
    pub fn plan(&self, domain: Option<&str>, env: &EnvironmentMap) -> Result<SitePlan, ProvisionError> {
        let domain = validate_domain(domain)?;
        let resolution = credentials::resolve(env, &self.cascade);
        let decision = match &resolution.credentials {
            Some(c) => CredentialDecision::enabled(&c.username, &self.layout.htpasswd),
            None => CredentialDecision::disabled(),
        };
        let inputs = self.inputs(&domain, env, &decision)?;
        Ok(SitePlan::build(&inputs, &self.layout))
    }
}

/// External programs a run depends on.
pub struct Collaborators<'a> {
    pub hasher: &'a dyn PasswordHasher,
    pub issuer: &'a dyn CertificateIssuer,
    pub daemon: &'a dyn ProxyDaemon,
}

/// Accept a bare DNS name: labels of letters, digits and hyphens.
pub fn validate_domain(domain: Option<&str>) -> Result<String, ProvisionError> {
    let domain = domain.map(str::trim).unwrap_or_default();
    if domain.is_empty() {
        return Err(ProvisionError::MissingDomain);
    }
    let valid = domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(ProvisionError::InvalidDomain(domain.to_owned()));
    }
    Ok(domain.to_ascii_lowercase())
}

/// Monitoring and application upstreams from the environment.
pub fn upstreams(env: &EnvironmentMap) -> Result<(HostPort, HostPort), ProvisionError> {
    let monitor = HostPort::from_base_url(
        env.non_blank(env::NETDATA_BASE)
            .unwrap_or(env::DEFAULT_NETDATA_BASE),
    )?;

    let app = match env.non_blank(env::APP_UPSTREAM) {
        Some(up) => up.trim().parse()?,
        None => {
            let port = env.non_blank(env::APP_PORT).unwrap_or(env::DEFAULT_APP_PORT);
            format!("127.0.0.1:{}", port.trim()).parse()?
        }
    };
    Ok((monitor, app))
}

/// Operator contact for the certificate tool.
pub fn contact(env: &EnvironmentMap, domain: &str) -> String {
    env.first_of(env::CONTACT_KEYS)
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|| format!("admin@{domain}"))
}

pub struct Provisioner<'a> {
    cfg: &'a ProvisionConfig,
    tools: Collaborators<'a>,
}

impl<'a> Provisioner<'a> {
    pub fn new(cfg: &'a ProvisionConfig, tools: Collaborators<'a>) -> Self {
        Self { cfg, tools }
    }

    fn layout(&self) -> &Layout {
        &self.cfg.layout
    }

    /// Full run. Degraded steps are recorded in the report; only input,
    /// write and validation failures are returned as errors.
    pub async fn run(
        &self,
        domain: Option<&str>,
        env: &EnvironmentMap,
    ) -> Result<RunReport, ProvisionError> {
        let domain = validate_domain(domain)?;
        // Fail on bad upstreams before anything is written.
        upstreams(env)?;
        let mut report = RunReport::new(&domain);

        let decision = self.resolve_credentials(env, &mut report).await?;
        let mut inputs = self.cfg.inputs(&domain, env, &decision)?;
        let plan = SitePlan::build(&inputs, self.layout());
        self.commit(&plan, &mut report).await?;

        if self.cfg.skip_tls {
            report.tls = TlsStatus::Skipped;
            report.skipped("certificate step disabled");
            return Ok(report);
        }

        let req = CertRequest {
            domains: server_names(&domain),
            contact: contact(env, &domain),
            mode: self.cfg.issue_mode,
        };
        if let Err(e) = self.tools.issuer.obtain(&req).await {
            report.tls = TlsStatus::Failed {
                error: e.to_string(),
            };
            if plan.has_tls() {
                report.degraded(format!(
                    "certificate tool failed ({e}); existing certificate stays in use"
                ));
            } else {
                report.degraded(format!("certificate tool failed ({e}); serving HTTP only"));
            }
            return Ok(report);
        }

        match self.cfg.issue_mode {
            IssueMode::CertOnly => {
                inputs.certs = self.layout().existing_certs(&domain);
                let secured = inputs.certs.is_some();
                report.tls = TlsStatus::Issued { secured };
                if !secured {
                    report.degraded(
                        "certificate tool succeeded but no certificate material was found; serving HTTP only",
                    );
                    return Ok(report);
                }
                report.ok(format!("certificate available for {}", req.domains.join(", ")));

                let secured_plan = SitePlan::build(&inputs, self.layout());
                if secured_plan.render_site() != plan.render_site() {
                    self.commit(&secured_plan, &mut report).await?;
                } else {
                    // Same site text; reload so a renewed certificate is picked up.
                    self.validate_and_reload(&mut report).await?;
                }
            }
            IssueMode::Nginx => {
                report.tls = TlsStatus::Issued { secured: true };
                report.ok(format!(
                    "certificate installed for {}",
                    req.domains.join(", ")
                ));
                self.patch(&plan, &mut report).await?;
            }
        }

        Ok(report)
    }

    /// Corrective pass only: make sure the secured block still carries the
    /// monitoring route.
    pub async fn run_patch(
        &self,
        domain: Option<&str>,
        env: &EnvironmentMap,
    ) -> Result<RunReport, ProvisionError> {
        let plan = self.cfg.plan(domain, env)?;
        let mut report = RunReport::new(&plan.domain);
        self.patch(&plan, &mut report).await?;
        Ok(report)
    }

    async fn resolve_credentials(
        &self,
        env: &EnvironmentMap,
        report: &mut RunReport,
    ) -> Result<CredentialDecision, ProvisionError> {
        let resolution = credentials::resolve(env, &self.cfg.cascade);
        let Some(creds) = resolution.credentials else {
            report.auth = Some(AuthStatus::Disabled {
                skipped: resolution.skipped,
            });
            report.skipped("basic auth disabled: no complete credential pair configured");
            return Ok(CredentialDecision::disabled());
        };

        let store = CredentialStore::new(&self.layout().htpasswd);
        let change = store
            .upsert(self.tools.hasher, &creds.username, &creds.password)
            .await?;

        report.auth = Some(AuthStatus::Enabled {
            username: creds.username.clone(),
            store: store.path().to_path_buf(),
            change,
        });
        report.ok(format!(
            "basic auth enabled for {} (from {})",
            creds.username, creds.source.user
        ));
        Ok(CredentialDecision::enabled(&creds.username, store.path()))
    }

    async fn commit(&self, plan: &SitePlan, report: &mut RunReport) -> Result<(), ProvisionError> {
        let summary = Synthesizer::new(self.layout()).write(plan)?;
        debug!(?summary, "synthesized");
        let listeners = if plan.has_tls() { "HTTP+HTTPS" } else { "HTTP" };
        report.ok(format!(
            "wrote {} ({listeners})",
            summary.site_file.display()
        ));
        if summary.removed_default {
            report.ok("removed default site from the active set");
        }
        self.validate_and_reload(report).await
    }

    async fn validate_and_reload(&self, report: &mut RunReport) -> Result<(), ProvisionError> {
        self.tools
            .daemon
            .validate()
            .await
            .map_err(ProvisionError::Validation)?;
        report.ok("proxy configuration is valid");

        match self.tools.daemon.reload().await {
            Ok(()) => report.ok("proxy reloaded"),
            Err(reload) => {
                report.degraded(format!("proxy reload failed: {reload}"));
                match self.tools.daemon.restart().await {
                    Ok(()) => report.ok("proxy restarted"),
                    Err(restart) => report.degraded(format!(
                        "proxy restart failed: {restart}; last good configuration stays active"
                    )),
                }
            }
        }
        Ok(())
    }

    async fn patch(&self, plan: &SitePlan, report: &mut RunReport) -> Result<(), ProvisionError> {
        let patcher = Patcher::new(
            Target {
                port: HTTPS_PORT,
                name: plan.domain.clone(),
            },
            plan.monitor_directive(),
        );
        let site = self.layout().site_file(&plan.domain);

        match patcher.apply(&site) {
            Ok(outcome) => {
                report.patch = Some(PatchStatus::Applied(outcome));
                match outcome {
                    PatchOutcome::Inserted { line } => {
                        report.ok(format!(
                            "restored monitoring route in the secured block of {} (line {line})",
                            site.display()
                        ));
                        self.validate_and_reload(report).await?;
                    }
                    PatchOutcome::AlreadyPresent => {
                        report.ok("secured block already serves the monitoring route");
                    }
                }
                Ok(())
            }
            Err(e @ PatchError::Write { .. }) => Err(ProvisionError::PatchWrite(e)),
            Err(e) => {
                report.patch = Some(PatchStatus::Unresolved {
                    error: e.to_string(),
                });
                report.degraded(format!("secured block not patched: {e}"));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_required_and_validated() {
        assert!(matches!(validate_domain(None), Err(ProvisionError::MissingDomain)));
        assert!(matches!(validate_domain(Some("  ")), Err(ProvisionError::MissingDomain)));
        for bad in ["exa mple.com", "example.com;", "a/b", "-x.com", "x..com", "{x}"] {
            assert!(
                matches!(validate_domain(Some(bad)), Err(ProvisionError::InvalidDomain(_))),
                "accepted {bad:?}"
            );
        }
        assert_eq!(validate_domain(Some("Example.COM")).unwrap(), "example.com");
    }

    #[test]
    fn upstreams_default_and_override() {
        let (monitor, app) = upstreams(&EnvironmentMap::default()).unwrap();
        assert_eq!(monitor.to_string(), "127.0.0.1:19999");
        assert_eq!(app.to_string(), "127.0.0.1:6969");

        let env: EnvironmentMap = [("PORT", "8000"), ("NETDATA_BASE", "http://10.0.0.5:19999/")]
            .into_iter()
            .collect();
        let (monitor, app) = upstreams(&env).unwrap();
        assert_eq!(monitor.to_string(), "10.0.0.5:19999");
        assert_eq!(app.to_string(), "127.0.0.1:8000");

        let env: EnvironmentMap = [("PORT", "8000"), ("APP_UPSTREAM", "app.internal:9000")]
            .into_iter()
            .collect();
        assert_eq!(upstreams(&env).unwrap().1.to_string(), "app.internal:9000");
    }

    #[test]
    fn bad_port_is_input_error() {
        let env: EnvironmentMap = [("PORT", "web")].into_iter().collect();
        let err = upstreams(&env).unwrap_err();
        assert_eq!(err.class(), crate::error::FailureClass::FatalInput);
    }

    #[test]
    fn contact_falls_back_to_domain() {
        assert_eq!(contact(&EnvironmentMap::default(), "example.com"), "admin@example.com");
        let env: EnvironmentMap = [("CERTBOT_EMAIL", "ops@example.com")].into_iter().collect();
        assert_eq!(contact(&env, "example.com"), "ops@example.com");
    }

    #[test]
    fn plan_needs_no_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProvisionConfig {
            layout: Layout::new(&dir.path().join("nginx"), &dir.path().join("le")),
            ..Default::default()
        };
        let env: EnvironmentMap = [("NETDATA_USER", "ops"), ("NETDATA_PASS", "pw")]
            .into_iter()
            .collect();

        let plan = cfg.plan(Some("example.com"), &env).unwrap();
        assert_eq!(plan.documents.len(), 1);
        let snippet = plan.snippet.as_ref().unwrap();
        assert!(snippet.content.contains("auth_basic \"Netdata\";"));
        assert!(!cfg.layout.htpasswd.exists());
        assert!(!cfg.layout.site_file("example.com").exists());
    }
}
