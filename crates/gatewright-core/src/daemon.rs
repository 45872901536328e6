use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::tool::{ToolCommand, ToolError};

/// Control surface of the proxy daemon.
#[async_trait]
pub trait ProxyDaemon: Send + Sync {
    /// Syntax-check the full configuration. Must pass before any reload.
    async fn validate(&self) -> Result<(), ToolError>;
    async fn reload(&self) -> Result<(), ToolError>;
    async fn restart(&self) -> Result<(), ToolError>;
}

/// nginx checked with `nginx -t`, managed through systemd.
pub struct NginxControl {
    pub nginx: String,
    pub systemctl: String,
    pub unit: String,
    pub timeout: Option<Duration>,
}

impl Default for NginxControl {
    fn default() -> Self {
        Self {
            nginx: "nginx".into(),
            systemctl: "systemctl".into(),
            unit: "nginx".into(),
            timeout: None,
        }
    }
}

impl NginxControl {
    async fn systemctl(&self, verb: &str) -> Result<(), ToolError> {
        ToolCommand::new(&self.systemctl)
            .args([verb, self.unit.as_str()])
            .timeout(self.timeout)
            .run()
            .await?;
        info!(unit = %self.unit, verb, "proxy daemon signalled");
        Ok(())
    }
}

#[async_trait]
impl ProxyDaemon for NginxControl {
    async fn validate(&self) -> Result<(), ToolError> {
        ToolCommand::new(&self.nginx)
            .arg("-t")
            .timeout(self.timeout)
            .run()
            .await
            .map(|_| ())
    }

    async fn reload(&self) -> Result<(), ToolError> {
        self.systemctl("reload").await
    }

    async fn restart(&self) -> Result<(), ToolError> {
        self.systemctl("restart").await
    }
}
