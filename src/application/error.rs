use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::{render::RenderServiceError, repos::RepoError},
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Top-level error of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Service(#[from] RenderServiceError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] RepoError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code: 2 for bad input, 3 for missing resources, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Domain(DomainError::Validation { .. })
            | AppError::Service(RenderServiceError::InvalidInput(_))
            | AppError::Config(_) => 2,
            AppError::Domain(DomainError::NotFound { .. })
            | AppError::Service(RenderServiceError::NotFound { .. }) => 3,
            _ => 1,
        }
    }

    /// The error followed by each of its sources.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let missing = AppError::from(RenderServiceError::not_found("revision", "7/initial"));
        assert_eq!(missing.exit_code(), 3);

        let invalid = AppError::from(DomainError::validation("bad name"));
        assert_eq!(invalid.exit_code(), 2);

        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }

    #[test]
    fn chain_includes_sources() {
        let err = AppError::from(RenderServiceError::Persistence(RepoError::NotFound));
        let chain = err.chain();
        assert_eq!(chain.first().map(String::as_str), Some("persistence failed: resource not found"));
    }
}
