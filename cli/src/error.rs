use thiserror::Error;

use search_bench_core::error::BenchError;

/// CLI-specific errors carrying the contractual exit codes
#[derive(Debug, Error)]
pub enum CliError {
    /// The user supplied something unusable (bad file, malformed or
    /// invalid definition)
    #[error("{0}")]
    User(String),

    /// The cluster could not run the benchmark to completion
    #[error("{0}")]
    Cluster(String),
}

impl CliError {
    /// Create a user error
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    /// Create a cluster error
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster(message.into())
    }

    /// The process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => exit_codes::USER_ERROR,
            Self::Cluster(_) => exit_codes::CLUSTER_ERROR,
        }
    }
}

impl From<BenchError> for CliError {
    fn from(error: BenchError) -> Self {
        match error {
            BenchError::InvalidDefinition(_)
            | BenchError::DuplicateBenchmark(_)
            | BenchError::UnknownBenchmark(_) => Self::User(error.to_string()),
            other => Self::Cluster(other.to_string()),
        }
    }
}

/// Exit codes for the different outcomes
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// User error (bad input, invalid definition)
    pub const USER_ERROR: i32 = 2;

    /// Cluster error (insufficient executors, failed run)
    pub const CLUSTER_ERROR: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::user("bad file").exit_code(), 2);
        assert_eq!(CliError::cluster("no nodes").exit_code(), 3);
    }

    #[test]
    fn test_bench_error_mapping() {
        let err: CliError = BenchError::InvalidDefinition("empty".to_string()).into();
        assert_eq!(err.exit_code(), exit_codes::USER_ERROR);

        let err: CliError = BenchError::InsufficientExecutors {
            required: 3,
            available: 1,
        }
        .into();
        assert_eq!(err.exit_code(), exit_codes::CLUSTER_ERROR);
    }
}
