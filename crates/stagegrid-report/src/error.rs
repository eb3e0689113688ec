use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },
}

pub type ReportResult<T> = Result<T, ReportError>;
