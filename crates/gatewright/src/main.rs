use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use gatewright_core::configure;
use gatewright_core::{
    Certbot, Collaborators, EnvironmentMap, HtpasswdTool, IssueMode, Layout, NginxControl,
    PrefixMode, ProvisionConfig, ProvisionError, Provisioner, RunReport,
};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "gatewright",
    about = "Gatewright — fronts an app and its Netdata dashboard with nginx",
    version
)]
struct Cli {
    /// Log level: error, warn, info, debug, verbose (default: $GATEWRIGHT_LOG_LEVEL or warn)
    #[arg(long, global = true, env = "GATEWRIGHT_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the site, enable auth if configured, obtain certificates and
    /// repair the secured block afterwards
    Provision {
        #[command(flatten)]
        site: SiteArgs,
        #[command(flatten)]
        tools: ToolArgs,
        /// Certificate mode: nginx (tool edits the config) or certonly
        #[arg(long, env = "GATEWRIGHT_ISSUE_MODE", default_value_t = IssueMode::Nginx)]
        issue_mode: IssueMode,
        /// Do not run the certificate tool
        #[arg(long, env = "GATEWRIGHT_SKIP_TLS")]
        skip_tls: bool,
        /// Request certificates from the staging environment
        #[arg(long, env = "GATEWRIGHT_STAGING")]
        staging: bool,
    },
    /// Print what provisioning would write, touching nothing
    Render {
        #[command(flatten)]
        site: SiteArgs,
    },
    /// Only restore the monitoring route in the secured block (certificate
    /// deploy hook)
    Patch {
        #[command(flatten)]
        site: SiteArgs,
        #[command(flatten)]
        tools: ToolArgs,
    },
    /// Write or update the env file non-interactively
    Configure {
        /// Env file to write
        #[arg(long, env = "GATEWRIGHT_ENV_FILE", default_value = ".env")]
        env_file: PathBuf,
        /// Override a key, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = configure::parse_assignment)]
        set: Vec<(String, String)>,
    },
}

#[derive(Args)]
struct SiteArgs {
    /// Target domain, e.g. example.com
    domain: Option<String>,
    /// Env file with credentials and upstream settings
    #[arg(long, env = "GATEWRIGHT_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,
    /// nginx configuration root
    #[arg(long, env = "GATEWRIGHT_NGINX_DIR", default_value = "/etc/nginx")]
    nginx_dir: PathBuf,
    /// Certificate root
    #[arg(long, env = "GATEWRIGHT_LETSENCRYPT_DIR", default_value = "/etc/letsencrypt")]
    letsencrypt_dir: PathBuf,
    /// Credential store (default: <nginx-dir>/.htpasswd)
    #[arg(long, env = "GATEWRIGHT_HTPASSWD")]
    htpasswd: Option<PathBuf>,
    /// Prefix strategy for the dashboard: strip-prefix, rewrite-body, pass-through
    #[arg(long, env = "GATEWRIGHT_STRATEGY", default_value_t = PrefixMode::StripPrefix)]
    strategy: PrefixMode,
    /// Inline the dashboard route instead of including a shared snippet
    #[arg(long, env = "GATEWRIGHT_NO_SNIPPET")]
    no_snippet: bool,
}

#[derive(Args)]
struct ToolArgs {
    /// Kill external tools after this long, e.g. 90s (default: no limit)
    #[arg(long, env = "GATEWRIGHT_TOOL_TIMEOUT", value_parser = humantime::parse_duration)]
    tool_timeout: Option<Duration>,
    /// Print the run report as JSON instead of status lines
    #[arg(long)]
    json: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = cli.log_level.clone().unwrap_or_else(|| "warn".into());
    let effective_log_level = if raw.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Provision {
            site,
            tools,
            issue_mode,
            skip_tls,
            staging,
        } => cmd_provision(site, tools, issue_mode, skip_tls, staging).await,

        Commands::Render { site } => cmd_render(site),

        Commands::Patch { site, tools } => cmd_patch(site, tools).await,

        Commands::Configure { env_file, set } => cmd_configure(&env_file, &set),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

impl SiteArgs {
    fn config(&self) -> ProvisionConfig {
        let mut layout = Layout::new(&self.nginx_dir, &self.letsencrypt_dir);
        if let Some(path) = &self.htpasswd {
            layout.htpasswd = path.clone();
        }
        ProvisionConfig {
            layout,
            strategy: self.strategy,
            shared_snippet: !self.no_snippet,
            ..Default::default()
        }
    }

    fn env(&self) -> Result<EnvironmentMap> {
        EnvironmentMap::load(&self.env_file)
            .with_context(|| format!("load {}", self.env_file.display()))
    }
}

/// The real collaborators, all sharing one timeout.
struct Toolbox {
    hasher: HtpasswdTool,
    issuer: Certbot,
    daemon: NginxControl,
}

impl Toolbox {
    fn new(timeout: Option<Duration>, staging: bool) -> Self {
        Self {
            hasher: HtpasswdTool {
                timeout,
                ..Default::default()
            },
            issuer: Certbot {
                staging,
                timeout,
                ..Default::default()
            },
            daemon: NginxControl {
                timeout,
                ..Default::default()
            },
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            hasher: &self.hasher,
            issuer: &self.issuer,
            daemon: &self.daemon,
        }
    }
}

async fn cmd_provision(
    site: SiteArgs,
    tools: ToolArgs,
    issue_mode: IssueMode,
    skip_tls: bool,
    staging: bool,
) -> Result<()> {
    let cfg = ProvisionConfig {
        issue_mode,
        skip_tls,
        ..site.config()
    };
    let env = site.env()?;
    debug!(keys = env.len(), "environment loaded");

    let toolbox = Toolbox::new(tools.tool_timeout, staging);
    let provisioner = Provisioner::new(&cfg, toolbox.collaborators());
    let result = provisioner.run(site.domain.as_deref(), &env).await;
    finish(result, tools.json)
}

async fn cmd_patch(site: SiteArgs, tools: ToolArgs) -> Result<()> {
    let cfg = site.config();
    let env = site.env()?;

    let toolbox = Toolbox::new(tools.tool_timeout, false);
    let provisioner = Provisioner::new(&cfg, toolbox.collaborators());
    let result = provisioner.run_patch(site.domain.as_deref(), &env).await;
    finish(result, tools.json)
}

fn cmd_render(site: SiteArgs) -> Result<()> {
    let cfg = site.config();
    let env = site.env()?;

    let plan = cfg.plan(site.domain.as_deref(), &env).map_err(fatal)?;

    if let Some(snippet) = &plan.snippet {
        println!("# ── {} ──", snippet.path.display());
        print!("{}", snippet.content);
        println!();
    }
    println!("# ── {} ──", cfg.layout.site_file(&plan.domain).display());
    print!("{}", plan.render_site());
    Ok(())
}

fn cmd_configure(env_file: &Path, set: &[(String, String)]) -> Result<()> {
    let count = configure::write_env_file(env_file, set)?;
    println!("wrote {count} key(s) to {}", env_file.display());
    Ok(())
}

/// Degraded runs still exit 0; only fatal errors propagate.
fn finish(result: Result<RunReport, ProvisionError>, json: bool) -> Result<()> {
    match result {
        Ok(report) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize report")?
                );
            } else {
                for line in report.lines() {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Err(err) => {
            if json {
                let body = serde_json::json!({
                    "error": err.to_string(),
                    "class": err.class(),
                });
                println!("{body}");
            }
            Err(fatal(err))
        }
    }
}

fn fatal(err: ProvisionError) -> anyhow::Error {
    match err {
        ProvisionError::MissingDomain => {
            anyhow!("{err}\n\nusage: gatewright <provision|render|patch> <domain> [OPTIONS]")
        }
        other => anyhow::Error::new(other),
    }
}
