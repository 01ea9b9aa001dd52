use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::SERIALIZATION_TYPE_LEN;

/// Serializer for frame bodies, selected by the name carried in the header.
///
/// JSON is currently the only built-in format, but the enum allows for future
/// extensibility. A serializer never returns an empty value silently: empty or
/// malformed input is a [`RpcError::Serialization`].
///
/// # Example
///
/// ```
/// use kestrel_common::transport::Serialization;
/// use kestrel_common::protocol::RpcRequest;
///
/// let serialization = Serialization::from_type("json").unwrap();
/// let request = RpcRequest::new("DemoService", "sayHello");
///
/// let bytes = serialization.serialize(&request).unwrap();
/// let decoded: RpcRequest = serialization.deserialize(&bytes).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Json(JsonSerialization),
}

impl Serialization {
    /// Name of the default serializer.
    pub const DEFAULT_TYPE: &'static str = JsonSerialization::TYPE;

    /// Resolves a serializer from the name found in a frame header.
    pub fn from_type(name: &str) -> Result<Self> {
        match name {
            JsonSerialization::TYPE => Ok(Serialization::Json(JsonSerialization)),
            other => Err(RpcError::UnknownSerialization(other.to_string())),
        }
    }

    /// The identifier written into the header's serialization type field.
    pub fn type_name(&self) -> &'static str {
        match self {
            Serialization::Json(_) => JsonSerialization::TYPE,
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serialization::Json(_) => JsonSerialization::serialize(value),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serialization::Json(_) => JsonSerialization::deserialize(data),
        }
    }
}

impl Default for Serialization {
    fn default() -> Self {
        Serialization::Json(JsonSerialization)
    }
}

/// Checks that a serialization name fits the fixed-width header field.
pub fn validate_type_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > SERIALIZATION_TYPE_LEN || !name.is_ascii() {
        return Err(RpcError::InvalidConfig(format!(
            "serialization type {:?} must be 1..={} ASCII bytes",
            name, SERIALIZATION_TYPE_LEN
        )));
    }
    if name.bytes().any(|b| b == 0) {
        return Err(RpcError::InvalidConfig(format!(
            "serialization type {:?} must not contain NUL bytes",
            name
        )));
    }
    Ok(())
}

/// JSON body serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonSerialization;

impl JsonSerialization {
    pub const TYPE: &'static str = "json";

    pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        if data.is_empty() {
            return Err(RpcError::Serialization("deserialize data is empty".to_string()));
        }
        serde_json::from_slice(data).map_err(|e| RpcError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcRequest, RpcResponse};
    use serde_json::json;

    #[test]
    fn test_resolve_json() {
        let s = Serialization::from_type("json").unwrap();
        assert_eq!(s.type_name(), "json");
        assert_eq!(s, Serialization::default());
    }

    #[test]
    fn test_unknown_type_is_error() {
        let err = Serialization::from_type("protostuff").unwrap_err();
        assert!(matches!(err, RpcError::UnknownSerialization(ref n) if n == "protostuff"));
    }

    #[test]
    fn test_response_round_trip() {
        let s = Serialization::default();
        let response = RpcResponse::success(json!({"nested": [1, 2, 3]})).echo_flags(true, false);
        let bytes = s.serialize(&response).unwrap();
        let decoded: RpcResponse = s.deserialize(&bytes).unwrap();
        assert_eq!(response, decoded);
    }

    #[test]
    fn test_empty_input_is_error() {
        let err = Serialization::default().deserialize::<RpcRequest>(&[]).unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)));
    }

    #[test]
    fn test_garbage_input_is_error() {
        let err = Serialization::default()
            .deserialize::<RpcRequest>(&[0xff, 0x00, 0x13])
            .unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)));
    }

    #[test]
    fn test_validate_type_name() {
        assert!(validate_type_name("json").is_ok());
        assert!(validate_type_name("0123456789abcdef").is_ok());
        assert!(validate_type_name("0123456789abcdefg").is_err());
        assert!(validate_type_name("").is_err());
        assert!(validate_type_name("jsön").is_err());
    }
}
