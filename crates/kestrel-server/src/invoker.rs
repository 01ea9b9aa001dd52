//! Invocation strategies.
//!
//! The provider calls service methods only through the [`Invoker`] trait. Both
//! strategies give identical results and errors; they differ only in how a
//! method is resolved.

use std::sync::Arc;

use dashmap::DashMap;
use kestrel_common::{Result, RpcError, RpcRequest, RpcValue, ServiceKey};

use crate::config::InvokerKind;
use crate::service::{ServiceInstance, ServiceMethod};

/// Calls the method a request names on a resolved service instance.
pub trait Invoker: Send + Sync {
    /// # Errors
    ///
    /// - [`RpcError::MethodNotFound`] if no method matches the name and
    ///   parameter types
    /// - [`RpcError::Invocation`] if the method fails
    fn invoke(&self, key: &ServiceKey, instance: &ServiceInstance, request: &RpcRequest) -> Result<RpcValue>;

    fn kind(&self) -> InvokerKind;
}

/// Creates the invoker for the configured strategy.
pub fn invoker_for(kind: InvokerKind) -> Arc<dyn Invoker> {
    match kind {
        InvokerKind::Dynamic => Arc::new(DynamicInvoker),
        InvokerKind::Cached => Arc::new(CachedInvoker::new()),
    }
}

/// Resolves the method by name and parameter types on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicInvoker;

impl Invoker for DynamicInvoker {
    fn invoke(&self, _key: &ServiceKey, instance: &ServiceInstance, request: &RpcRequest) -> Result<RpcValue> {
        let method = resolve(instance, request)?;
        call(&method, request)
    }

    fn kind(&self) -> InvokerKind {
        InvokerKind::Dynamic
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodSignature {
    service: ServiceKey,
    method: String,
    parameter_types: Vec<String>,
}

/// Resolves each (service, method, parameter types) once and reuses it.
///
/// Only successful resolutions are cached, so a missing method costs a
/// lookup each time it is requested.
#[derive(Debug, Default)]
pub struct CachedInvoker {
    resolved: DashMap<MethodSignature, Arc<ServiceMethod>>,
}

impl CachedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached resolutions.
    pub fn cached(&self) -> usize {
        self.resolved.len()
    }
}

impl Invoker for CachedInvoker {
    fn invoke(&self, key: &ServiceKey, instance: &ServiceInstance, request: &RpcRequest) -> Result<RpcValue> {
        let signature = MethodSignature {
            service: key.clone(),
            method: request.method_name.clone(),
            parameter_types: request.parameter_types.clone(),
        };

        let cached = self.resolved.get(&signature).map(|entry| entry.value().clone());
        let method = match cached {
            Some(method) => method,
            None => {
                let method = resolve(instance, request)?;
                tracing::debug!(service = %key, method = ?method, "Caching resolved method");
                self.resolved.insert(signature, method.clone());
                method
            }
        };
        call(&method, request)
    }

    fn kind(&self) -> InvokerKind {
        InvokerKind::Cached
    }
}

fn resolve(instance: &ServiceInstance, request: &RpcRequest) -> Result<Arc<ServiceMethod>> {
    instance
        .find_method(&request.method_name, &request.parameter_types)
        .cloned()
        .ok_or_else(|| RpcError::MethodNotFound {
            class_name: request.class_name.clone(),
            method_name: request.method_name.clone(),
            parameter_types: request.parameter_types.join(", "),
        })
}

fn call(method: &ServiceMethod, request: &RpcRequest) -> Result<RpcValue> {
    method
        .call(&request.parameters)
        .map_err(|e| RpcError::Invocation(format!("{:#}", e)))
}
