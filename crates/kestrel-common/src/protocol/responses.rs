//! Kestrel Response Types
//!
//! This module defines the body of a RESPONSE frame.

use serde::{Deserialize, Serialize};

use super::RpcValue;

/// Body of a RESPONSE frame.
///
/// Application-level failures travel inside this body rather than as
/// transport errors: `error` is set and the header status is `Fail`. It is up
/// to the caller to check [`is_error`](Self::is_error).
///
/// # Example
///
/// ```
/// use kestrel_common::protocol::RpcResponse;
/// use serde_json::json;
///
/// let ok = RpcResponse::success(json!("Hello lizhe"));
/// assert!(!ok.is_error());
///
/// let failed = RpcResponse::error("service not found");
/// assert!(failed.is_error());
/// assert!(failed.result.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RpcResponse {
    /// Result value (absent on failure or for methods returning nothing)
    pub result: Option<RpcValue>,
    /// Error description (present on failure)
    pub error: Option<String>,
    pub oneway: bool,
    #[serde(rename = "async")]
    pub async_call: bool,
}

impl RpcResponse {
    pub fn success(result: RpcValue) -> Self {
        RpcResponse {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        RpcResponse {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Copies the call-mode flags from the originating request.
    pub fn echo_flags(mut self, async_call: bool, oneway: bool) -> Self {
        self.async_call = async_call;
        self.oneway = oneway;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
