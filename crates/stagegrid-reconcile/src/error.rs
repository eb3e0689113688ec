//! Reconciler and cluster error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from the cluster control interface.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("`{command}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("unexpected cluster output: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from reconciler operations outside the tick itself.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("workload not tracked: {0}")]
    NotTracked(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
