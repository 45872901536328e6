pub mod certbot;
pub mod configure;
pub mod credentials;
pub mod daemon;
pub mod env;
pub mod error;
pub mod fsutil;
pub mod htpasswd;
pub mod layout;
pub mod patch;
pub mod provision;
pub mod report;
pub mod route;
pub mod tool;
pub mod vhost;

pub use certbot::{CertRequest, Certbot, CertificateIssuer, IssueMode};
pub use daemon::{NginxControl, ProxyDaemon};
pub use env::EnvironmentMap;
pub use error::{FailureClass, ProvisionError};
pub use htpasswd::{HtpasswdTool, PasswordHasher};
pub use layout::Layout;
pub use provision::{Collaborators, ProvisionConfig, Provisioner};
pub use report::RunReport;
pub use route::PrefixMode;
