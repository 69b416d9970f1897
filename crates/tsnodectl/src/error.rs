//! CLI error types

use thiserror::Error;
use tsnode_provision::{ProvisionError, SagaError};
use tsnode_secrets::CredentialError;
use tsnode_state::StateError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cannot determine the installation directory; pass --home or set TSNODE_HOME")]
    NoHome,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Saga(#[from] SagaError),
}

pub type CliResult<T> = Result<T, CliError>;
