//! Exposure error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while wiring or tearing down traffic exposure.
#[derive(Debug, Error)]
pub enum ExposeError {
    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("no redirection for workload {0}")]
    RedirectionNotFound(String),

    #[error("no proxy route for workload {0}")]
    RouteNotFound(String),

    #[error("no tunnel {0}")]
    TunnelNotFound(String),

    #[error("workload {0} has no backend address")]
    MissingBackend(String),

    #[error("path {path} is already routed to workload {owner}")]
    PathConflict { path: String, owner: String },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("alias file {path}: {source}")]
    Alias {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid url pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExposeResult<T> = Result<T, ExposeError>;
