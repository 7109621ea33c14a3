//! CLI error type.

use std::fmt;

use snapferry::config::ConfigError;
use snapferry::logging::LoggingError;
use snapferry::report::FinalStatus;
use snapferry::service::ServiceError;
use snapferry::session::FlowError;
use snapferry::transfer::{LogError, OutputError};

/// Errors surfaced by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Invalid or unusable configuration.
    Config(String),
    /// The session file could not be used.
    Session(String),
    /// Logging could not be initialised.
    Logging(LoggingError),
    /// The tokio runtime could not be started.
    Runtime(std::io::Error),
    /// An orchestration failure.
    Service(ServiceError),
    /// The integrity log could not be read.
    Log(LogError),
    /// An output directory could not be verified.
    Verify(OutputError),
    /// The transfer ran but did not complete.
    Incomplete(FinalStatus),
    /// Re-hashing found mismatches.
    VerificationFailed { failed_chunks: usize },
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Incomplete(FinalStatus::Cancelled) => 130,
            Self::Incomplete(_) | Self::VerificationFailed { .. } => 2,
            Self::Service(ServiceError::Policy(_)) => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Session(msg) => write!(f, "Session error: {}", msg),
            Self::Logging(e) => write!(f, "Logging error: {}", e),
            Self::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            Self::Service(ServiceError::Policy(e)) => write!(
                f,
                "Access denied ({}). {}",
                e.reason(),
                e.reason().guidance()
            ),
            Self::Service(e) => write!(f, "{}", e),
            Self::Log(e) => write!(f, "Integrity log error: {}", e),
            Self::Verify(e) => write!(f, "Verification error: {}", e),
            Self::Incomplete(status) => write!(f, "Transfer ended with status: {}", status),
            Self::VerificationFailed { failed_chunks } => {
                write!(f, "Verification failed: {} chunk(s) mismatched", failed_chunks)
            }
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<FlowError> for CliError {
    fn from(e: FlowError) -> Self {
        Self::Session(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        Self::Logging(e)
    }
}

impl From<ServiceError> for CliError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<LogError> for CliError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

impl From<OutputError> for CliError {
    fn from(e: OutputError) -> Self {
        Self::Verify(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapferry::session::{DenialReason, PolicyError};

    #[test]
    fn test_denial_message_names_reason() {
        let err = CliError::Service(ServiceError::Policy(PolicyError::Denied {
            reason: DenialReason::NotPrivileged,
        }));
        let message = err.to_string();
        assert!(message.starts_with("Access denied"));
        assert!(!message.contains("No backups"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Incomplete(FinalStatus::Cancelled).exit_code(), 130);
        assert_eq!(CliError::Incomplete(FinalStatus::Incomplete).exit_code(), 2);
        assert_eq!(CliError::Config("x".to_string()).exit_code(), 1);
    }
}
