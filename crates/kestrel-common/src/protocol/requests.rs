use serde::{Deserialize, Serialize};
use std::fmt;

pub type RequestId = u64;
pub type MethodName = String;

/// Opaque RPC argument or result value.
pub type RpcValue = serde_json::Value;

/// Body of a REQUEST frame: which method of which service to call, and with what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Target service (interface) name
    pub class_name: String,
    pub method_name: MethodName,
    /// Declared parameter type names, parallel to `parameters`
    pub parameter_types: Vec<String>,
    pub parameters: Vec<RpcValue>,
    pub version: String,
    pub group: String,
    pub oneway: bool,
    #[serde(rename = "async")]
    pub async_call: bool,
}

impl RpcRequest {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        RpcRequest {
            class_name: class_name.into(),
            method_name: method_name.into(),
            ..Default::default()
        }
    }

    /// Appends one parameter together with its declared type name.
    pub fn with_parameter(mut self, type_name: impl Into<String>, value: RpcValue) -> Self {
        self.parameter_types.push(type_name.into());
        self.parameters.push(value);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_async(mut self, async_call: bool) -> Self {
        self.async_call = async_call;
        self
    }

    pub fn with_oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    /// Key under which the provider looks up the target instance.
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.class_name, &self.version, &self.group)
    }
}

/// `class#version#group` identity of a registered service implementation.
///
/// `#` is assumed never to appear inside any of the three components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub const SEPARATOR: char = '#';

    pub fn new(class_name: &str, version: &str, group: &str) -> Self {
        ServiceKey(format!(
            "{class_name}{sep}{version}{sep}{group}",
            sep = Self::SEPARATOR
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
