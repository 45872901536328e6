use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::tool::{ToolCommand, ToolError};

/// How the certificate tool is allowed to touch the proxy configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueMode {
    /// The tool edits the site file itself (adds the secured server block).
    #[default]
    Nginx,
    /// The tool only obtains certificates; the secured block is synthesized.
    CertOnly,
}

impl FromStr for IssueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nginx" => Ok(Self::Nginx),
            "certonly" | "cert-only" => Ok(Self::CertOnly),
            other => Err(format!("unknown issue mode `{other}` (expected nginx or certonly)")),
        }
    }
}

impl fmt::Display for IssueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nginx => "nginx",
            Self::CertOnly => "certonly",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CertRequest {
    pub domains: Vec<String>,
    pub contact: String,
    pub mode: IssueMode,
}

/// Obtains or renews certificates. A failure is never fatal to a run.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(&self, req: &CertRequest) -> Result<(), ToolError>;
}

pub struct Certbot {
    pub program: String,
    pub staging: bool,
    pub timeout: Option<Duration>,
}

impl Default for Certbot {
    fn default() -> Self {
        Self {
            program: "certbot".into(),
            staging: false,
            timeout: None,
        }
    }
}

impl Certbot {
    pub fn args(&self, req: &CertRequest) -> Vec<String> {
        let mut args = Vec::new();
        if req.mode == IssueMode::CertOnly {
            args.push("certonly".to_owned());
        }
        args.extend(
            [
                "--nginx",
                "--non-interactive",
                "--agree-tos",
                "--keep-until-expiring",
                "-m",
            ]
            .map(String::from),
        );
        args.push(req.contact.clone());
        for d in &req.domains {
            args.push("-d".to_owned());
            args.push(d.clone());
        }
        if self.staging {
            args.push("--staging".to_owned());
        }
        args
    }
}

#[async_trait]
impl CertificateIssuer for Certbot {
    async fn obtain(&self, req: &CertRequest) -> Result<(), ToolError> {
        ToolCommand::new(&self.program)
            .args(self.args(req))
            .timeout(self.timeout)
            .run()
            .await?;
        info!(domains = ?req.domains, mode = %req.mode, "certificate obtained or still valid");
        Ok(())
    }
}
