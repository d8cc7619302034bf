use thiserror::Error;
use uuid::Uuid;

use crate::types::{ParentRole, Provider};

#[derive(Error, Debug)]
pub enum RootlineError {
    #[error("Authentication failed for {provider}: {message} (please re-authenticate)")]
    Authentication { provider: Provider, message: String },

    #[error("Extraction failed for {external_id}: {message}")]
    Extraction { external_id: String, message: String },

    #[error("Transient network error: {0}")]
    NetworkTransient(String),

    #[error("Request rejected (status {status}): {message}")]
    NetworkPermanent { status: u16, message: String },

    #[error("Identity conflict: {provider}:{external_id} is bound to {existing}, refusing to link it to {requested}")]
    Conflict {
        provider: Provider,
        external_id: String,
        existing: Uuid,
        requested: Uuid,
    },

    #[error("Parent conflict: {child} already has {role} {existing}, refusing to link {requested}")]
    ParentConflict {
        child: Uuid,
        role: ParentRole,
        existing: Uuid,
        requested: Uuid,
    },

    #[error("Operation {0} is already in progress")]
    OperationInProgress(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RootlineError {
    pub fn extraction(external_id: &str, message: impl Into<String>) -> Self {
        RootlineError::Extraction {
            external_id: external_id.to_string(),
            message: message.into(),
        }
    }

    /// Eligible for bounded retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RootlineError::NetworkTransient(_))
    }

    /// Aborts the active operation rather than being recorded per unit.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RootlineError::Extraction { .. } | RootlineError::NetworkTransient(_)
        )
    }

    pub fn needs_reauth(&self) -> bool {
        matches!(self, RootlineError::Authentication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_asks_for_reauth() {
        let err = RootlineError::Authentication {
            provider: Provider::Ancestry,
            message: "session expired".into(),
        };
        assert!(err.needs_reauth());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("please re-authenticate"));
    }

    #[test]
    fn extraction_is_recorded_not_fatal() {
        let err = RootlineError::extraction("L1", "name selector missing");
        assert!(!err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn permanent_network_errors_are_fatal() {
        let err = RootlineError::NetworkPermanent {
            status: 404,
            message: "gone".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }
}
