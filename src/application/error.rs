use std::error::Error as StdError;

use thiserror::Error;

use crate::{config::LoadError, domain::error::DomainError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Top-level message followed by every `source()` in the chain.
    pub fn messages(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }

    /// Whether the failure came from talking to the cluster rather than from
    /// local configuration.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Infra(
                InfraError::Http(_)
                    | InfraError::Status { .. }
                    | InfraError::GraphQl { .. }
                    | InfraError::Decode { .. }
                    | InfraError::WebSocket { .. }
            )
        )
    }
}
