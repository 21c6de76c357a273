// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Client-visible error kinds for benchmark orchestration.

use thiserror::Error;

use crate::search::SearchFailure;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Result type for benchmark operations
pub type BenchResult<T> = Result<T, BenchError>;

/// Benchmark orchestration errors
#[derive(Debug, Error)]
pub enum BenchError {
    /// Fewer benchmark-capable nodes are alive than the definition requires
    #[error("insufficient executor nodes: required {required}, available {available}")]
    InsufficientExecutors {
        /// Nodes the definition asked for
        required: usize,
        /// Benchmark-capable nodes currently alive
        available: usize,
    },

    /// The targeted benchmark id (or pattern) matched nothing
    #[error("unknown benchmark: {0}")]
    UnknownBenchmark(String),

    /// A benchmark with this id is already registered in cluster state
    #[error("benchmark already exists: {0}")]
    DuplicateBenchmark(String),

    /// The submitted definition failed validation
    #[error("invalid benchmark definition: {0}")]
    InvalidDefinition(String),

    /// The operation was invoked on a node that is not the elected master
    #[error("not the elected master")]
    NotMaster,

    /// Leadership changed while a response was pending; the benchmark may
    /// still be running under the new master
    #[error("master left before benchmark {benchmark_id} responded; poll status to reconcile")]
    MasterLost {
        /// Id of the request whose listener was lost
        benchmark_id: String,
    },

    /// Client-side deadline exceeded; the benchmark itself keeps running
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// The operation that was being awaited
        operation: String,
    },

    /// RPC-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Cluster-state store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure raised by the search layer
    #[error(transparent)]
    Search(#[from] SearchFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BenchError::InsufficientExecutors {
            required: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient executor nodes: required 3, available 1"
        );

        let err = BenchError::Timeout {
            operation: "pause".to_string(),
        };
        assert!(err.to_string().contains("pause"));
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: BenchError = TransportError::NoMaster.into();
        assert!(matches!(err, BenchError::Transport(_)));
    }
}
