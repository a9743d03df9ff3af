use thiserror::Error;

use txcoord_core::{ErrorCode, Status};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to bind admin endpoint: {0}")]
    Bind(#[from] warp::Error),

    #[error("invalid shard endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("command failed: {0}")]
    Command(#[from] Status),
}

impl WireError {
    /// Status a coordinator sees for a failed RPC. Transport failures are transient.
    pub fn into_status(self) -> Status {
        match self {
            WireError::Command(status) => status,
            WireError::Http(err) if err.is_timeout() => {
                Status::new(ErrorCode::NetworkTimeout, err.to_string())
            }
            WireError::Http(err) => Status::new(ErrorCode::HostUnreachable, err.to_string()),
            WireError::Bind(err) => Status::new(ErrorCode::InternalError, err.to_string()),
            WireError::InvalidEndpoint(url) => {
                Status::new(ErrorCode::HostUnreachable, format!("invalid shard endpoint {}", url))
            }
        }
    }
}
