//! Provisioning error types

use thiserror::Error;

use crate::ssh::SshError;

/// Errors surfaced by provisioners and the orchestrator
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Caller-correctable specification problem
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Network or authentication failure against a remote host
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// Non-zero remote exit; stderr captured verbatim
    #[error("command failed on {host}: {stderr}")]
    CommandFailed { host: String, stderr: String },

    /// Declared but unimplemented capability
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Unknown cluster or other missing resource
    #[error("{0}")]
    NotFound(String),

    /// No provisioner registered for a provider tag
    #[error("provisioner not found for provider '{0}'")]
    ProvisionerNotFound(String),

    /// The operation observed cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unexpected repository or invariant failure
    #[error("{0}")]
    Internal(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl From<SshError> for ProvisionError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::InvalidSpec(msg) => ProvisionError::InvalidSpec(msg),
            SshError::ConnectionFailed { host, reason } => {
                ProvisionError::ConnectionFailed { host, reason }
            }
            SshError::CommandFailed { host, stderr, .. } => {
                ProvisionError::CommandFailed { host, stderr }
            }
            SshError::Cancelled { host, .. } => ProvisionError::Cancelled(host),
            SshError::Closed => ProvisionError::Internal("session is closed".to_string()),
            SshError::Io(e) => ProvisionError::Internal(format!("i/o error: {}", e)),
        }
    }
}

/// Map a repository error into a provisioning error
pub fn db_err(err: sqlx::Error) -> ProvisionError {
    ProvisionError::Internal(format!("database error: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_error_mapping() {
        let err: ProvisionError = SshError::InvalidSpec("no key".into()).into();
        assert!(matches!(err, ProvisionError::InvalidSpec(_)));

        let err: ProvisionError = SshError::ConnectionFailed {
            host: "10.0.0.1".into(),
            reason: "refused".into(),
        }
        .into();
        assert!(matches!(err, ProvisionError::ConnectionFailed { .. }));

        let err: ProvisionError = SshError::CommandFailed {
            host: "10.0.0.1".into(),
            code: 1,
            stdout: String::new(),
            stderr: "boom".into(),
        }
        .into();
        match err {
            ProvisionError::CommandFailed { host, stderr } => {
                assert_eq!(host, "10.0.0.1");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }
}
