//! Service registration.
//!
//! A [`ServiceRegistry`] maps a [`ServiceKey`] (`class#version#group`) to a
//! [`ServiceInstance`], a named table of methods. Each method is declared with
//! the parameter type names a consumer must send and a typed handler; the
//! ordered parameter list of a request is deserialized into the handler's
//! argument tuple.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kestrel_common::{RpcValue, ServiceKey};
use serde::de::DeserializeOwned;
use serde::Serialize;

type Handler = dyn Fn(&[RpcValue]) -> anyhow::Result<RpcValue> + Send + Sync;

/// One callable method of a service.
pub struct ServiceMethod {
    name: String,
    parameter_types: Vec<String>,
    handler: Box<Handler>,
}

impl ServiceMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    /// Whether this method answers to `name` called with `parameter_types`.
    pub fn matches(&self, name: &str, parameter_types: &[String]) -> bool {
        self.name == name && self.parameter_types == parameter_types
    }

    /// Calls the method with the request's parameters.
    pub fn call(&self, parameters: &[RpcValue]) -> anyhow::Result<RpcValue> {
        (self.handler)(parameters)
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.parameter_types.join(", "))
    }
}

/// A service implementation: a named set of methods.
///
/// # Example
///
/// ```
/// use kestrel_server::ServiceInstance;
/// use serde_json::json;
///
/// let service = ServiceInstance::new("DemoService")
///     .method("sayHello", &["String"], |(name,): (String,)| Ok(format!("Hello {}", name)))
///     .method("add", &["int", "int"], |(a, b): (i64, i64)| Ok(a + b));
///
/// let say_hello = service.find_method("sayHello", &["String".to_string()]).unwrap();
/// assert_eq!(say_hello.call(&[json!("lizhe")]).unwrap(), json!("Hello lizhe"));
/// ```
#[derive(Debug)]
pub struct ServiceInstance {
    name: String,
    methods: Vec<Arc<ServiceMethod>>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Adds a method.
    ///
    /// `A` is the argument tuple: `(String,)` for one parameter, `(i64, i64)`
    /// for two, `()` for none. Arguments that do not deserialize into `A` fail
    /// the call without reaching the handler.
    pub fn method<A, R, F>(mut self, name: &str, parameter_types: &[&str], handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let method_name = name.to_string();
        let wrapped = move |parameters: &[RpcValue]| -> anyhow::Result<RpcValue> {
            let arguments = if parameters.is_empty() {
                RpcValue::Null
            } else {
                RpcValue::Array(parameters.to_vec())
            };
            let arguments: A = serde_json::from_value(arguments).map_err(|e| {
                anyhow::anyhow!("invalid arguments for {}: {}", method_name, e)
            })?;
            let result = handler(arguments)?;
            Ok(serde_json::to_value(result)?)
        };

        self.methods.push(Arc::new(ServiceMethod {
            name: name.to_string(),
            parameter_types: parameter_types.iter().map(|t| t.to_string()).collect(),
            handler: Box::new(wrapped),
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[Arc<ServiceMethod>] {
        &self.methods
    }

    /// Finds the method with this name and exact parameter type list.
    pub fn find_method(&self, name: &str, parameter_types: &[String]) -> Option<&Arc<ServiceMethod>> {
        self.methods
            .iter()
            .find(|method| method.matches(name, parameter_types))
    }
}

/// Read-only map from service key to implementation, built before the
/// provider starts.
///
/// # Example
///
/// ```
/// use kestrel_server::{ServiceInstance, ServiceRegistry};
/// use kestrel_common::ServiceKey;
///
/// let registry = ServiceRegistry::new().with_service(
///     "1.0.0",
///     "test",
///     ServiceInstance::new("DemoService"),
/// );
/// assert!(registry.get(&ServiceKey::new("DemoService", "1.0.0", "test")).is_some());
/// ```
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceKey, Arc<ServiceInstance>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under `instance.name()#version#group`.
    ///
    /// A later registration with the same key replaces the earlier one.
    pub fn register(&mut self, version: &str, group: &str, instance: ServiceInstance) -> ServiceKey {
        let key = ServiceKey::new(instance.name(), version, group);
        tracing::debug!(service = %key, methods = instance.methods().len(), "Registering service");
        if self.services.insert(key.clone(), Arc::new(instance)).is_some() {
            tracing::warn!(service = %key, "Service registered twice, keeping the latest");
        }
        key
    }

    pub fn with_service(mut self, version: &str, group: &str, instance: ServiceInstance) -> Self {
        self.register(version, group, instance);
        self
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&Arc<ServiceInstance>> {
        self.services.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.services.keys()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
