use thiserror::Error;

use super::RequestId;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Invalid magic number: {0:#06x}")]
    InvalidMagic(u16),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown serialization type: {0:?}")]
    UnknownSerialization(String),

    #[error("Service not found: {service_key}")]
    ServiceNotFound { service_key: String },

    #[error("Method not found: {class_name}.{method_name}({parameter_types})")]
    MethodNotFound {
        class_name: String,
        method_name: String,
        parameter_types: String,
    },

    #[error("Invocation error: {0}")]
    Invocation(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error(
        "Timeout exception. Request id: {request_id}. Request class name: {class_name}. Request method: {method_name}"
    )]
    Timeout {
        request_id: RequestId,
        class_name: String,
        method_name: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Returns true for errors that leave the byte stream in an unknown state.
    ///
    /// A connection that produced one of these cannot be resynchronised and
    /// must be closed.
    pub fn is_fatal_framing(&self) -> bool {
        matches!(
            self,
            RpcError::InvalidMagic(_) | RpcError::FrameTooLarge { .. } | RpcError::Io(_)
        )
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
