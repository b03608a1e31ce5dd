//! Error taxonomy
//!
//! Functional blocks never throw across the message-dispatch boundary: every
//! failure either becomes a CALLERROR on the wire or a typed Rejected status
//! in a response. These types carry failures between the layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Not found: {entity} with {field}={value}")]
    NotFound {
        entity: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("Validation: {0}")]
    Validation(String),

    #[error("Not connected to CSMS")]
    Offline,

    #[error("Response timeout for {0}")]
    Timeout(String),

    #[error("CSMS rejected {action}: {code} {description}")]
    CallError {
        action: String,
        code: String,
        description: String,
    },

    #[error("Feature unavailable: {0}")]
    FeatureUnavailable(String),

    #[error("Configuration: missing or invalid variable {component}/{variable}")]
    Configuration {
        component: String,
        variable: String,
    },

    #[error("Security: {0}")]
    Security(String),
}

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Certificate store error: {0}")]
    CertificateStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl AppError {
    /// True when retrying the same operation later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Domain(DomainError::Offline)
                | AppError::Domain(DomainError::Timeout(_))
                | AppError::Infra(InfraError::WebSocket(_))
        )
    }
}
