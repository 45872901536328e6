use serde::Serialize;
use thiserror::Error;

use crate::htpasswd::StoreError;
use crate::patch::PatchError;
use crate::route::RouteError;
use crate::tool::ToolError;
use crate::vhost::SynthError;

/// Failures that abort a run. Degraded outcomes are not errors; they are
/// recorded in the [`RunReport`](crate::report::RunReport).
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("a target domain is required")]
    MissingDomain,

    #[error("invalid domain `{0}`")]
    InvalidDomain(String),

    #[error(transparent)]
    Upstream(#[from] RouteError),

    #[error("credential store: {0}")]
    Credentials(#[from] StoreError),

    #[error(transparent)]
    Synthesis(#[from] SynthError),

    #[error("patch: {0}")]
    PatchWrite(#[source] PatchError),

    #[error("proxy rejected the generated configuration, not reloading: {0}")]
    Validation(#[source] ToolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    FatalInput,
    FatalWrite,
    FatalValidation,
}

impl ProvisionError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::MissingDomain | Self::InvalidDomain(_) | Self::Upstream(_) => {
                FailureClass::FatalInput
            }
            Self::Credentials(_) | Self::Synthesis(_) | Self::PatchWrite(_) => {
                FailureClass::FatalWrite
            }
            Self::Validation(_) => FailureClass::FatalValidation,
        }
    }
}
