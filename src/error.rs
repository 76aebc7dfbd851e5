//! Centralized error types for plugin-pilot
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.
//!
//! The pipeline state machine decides transitions from these kinds, not from
//! whatever upstream exception happened to surface, so every failure that can
//! change a plugin's lifecycle has its own variant.

use thiserror::Error;

/// Top-level error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("No Dockerfile or manifest found at the working tree root")]
    BuildRecipeMissing,

    #[error("Image build failed")]
    BuildFailed { log: String },

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Scanner failure: {0}")]
    ScanInfraFailure(String),

    #[error("Deployment apply failed: {0}")]
    DeploymentFailed(String),

    #[error("Service apply failed: {0}")]
    ServiceFailed(String),

    #[error("Route apply failed: {0}")]
    RouteFailed(String),

    #[error("Pipeline configuration not found: {0}")]
    PipelineConfigMissing(String),

    #[error("{0}")]
    BadSchedule(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Advisory HTTP status for the synchronous surface. The response body's
    /// `status` field is authoritative; this only picks the wire code.
    pub fn advisory_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::PermissionDenied(_) => 403,
            Error::BadRequest(_) | Error::BadSchedule(_) => 400,
            Error::AuthFailed(_) => 401,
            Error::SourceUnavailable(_)
            | Error::BuildRecipeMissing
            | Error::BuildFailed { .. }
            | Error::SignatureInvalid(_)
            | Error::ScanInfraFailure(_)
            | Error::DeploymentFailed(_)
            | Error::ServiceFailed(_)
            | Error::RouteFailed(_)
            | Error::PipelineConfigMissing(_) => 422,
            Error::Internal(_) => 500,
        }
    }

    /// Message stored on the version record when a pipeline stage fails.
    /// Build failures carry the accumulated engine log.
    pub fn pipeline_message(&self) -> String {
        match self {
            Error::BuildFailed { log } => format!("Image build failed\n{}", log),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_status_mapping() {
        assert_eq!(Error::NotFound("plugin p1".into()).advisory_status(), 404);
        assert_eq!(Error::BadRequest("bad port".into()).advisory_status(), 400);
        assert_eq!(
            Error::SignatureInvalid("plugin.tar".into()).advisory_status(),
            422
        );
    }

    #[test]
    fn test_build_failure_carries_log() {
        let err = Error::BuildFailed {
            log: "step 3/7 failed".into(),
        };
        assert!(err.pipeline_message().contains("step 3/7 failed"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: Error = anyhow::anyhow!("boom").into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
