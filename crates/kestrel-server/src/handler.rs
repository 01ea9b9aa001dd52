use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use kestrel_common::{RpcError, RpcHeader, RpcProtocol, RpcRequest, RpcResponse, RpcStatus};

use crate::invoker::Invoker;
use crate::service::ServiceRegistry;

/// Turns a decoded request into the response frame to write back.
///
/// Runs on the provider's worker pool. Every failure, including an unknown
/// service, a missing method, a failing or panicking method, ends up in the
/// response body with `status = Fail`; nothing escapes to the connection.
pub struct RequestHandler {
    registry: Arc<ServiceRegistry>,
    invoker: Arc<dyn Invoker>,
}

impl RequestHandler {
    pub fn new(registry: Arc<ServiceRegistry>, invoker: Arc<dyn Invoker>) -> Self {
        Self { registry, invoker }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn handle(&self, request: RpcProtocol<RpcRequest>) -> RpcProtocol<RpcResponse> {
        let (header, body) = request.into_parts();
        let request_id = header.request_id;

        match self.invoke(&body) {
            Ok(result) => {
                tracing::debug!(
                    request_id,
                    class = %body.class_name,
                    method = %body.method_name,
                    "Request handled"
                );
                RpcProtocol::new(
                    header.into_response(RpcStatus::Success),
                    RpcResponse::success(result).echo_flags(body.async_call, body.oneway),
                )
            }
            Err(e) => {
                tracing::error!(
                    request_id,
                    class = %body.class_name,
                    method = %body.method_name,
                    "Request failed: {}",
                    e
                );
                failure_response(header, body.async_call, body.oneway, e.to_string())
            }
        }
    }

    fn invoke(&self, request: &RpcRequest) -> kestrel_common::Result<kestrel_common::RpcValue> {
        let key = request.service_key();
        let instance = self
            .registry
            .get(&key)
            .ok_or_else(|| RpcError::ServiceNotFound {
                service_key: key.to_string(),
            })?;

        panic::catch_unwind(AssertUnwindSafe(|| self.invoker.invoke(&key, instance, request)))
            .unwrap_or_else(|payload| Err(RpcError::Invocation(panic_message(payload.as_ref()))))
    }
}

/// Builds a FAIL response answering `header`.
pub fn failure_response(
    header: RpcHeader,
    async_call: bool,
    oneway: bool,
    error: impl Into<String>,
) -> RpcProtocol<RpcResponse> {
    RpcProtocol::new(
        header.into_response(RpcStatus::Fail),
        RpcResponse::error(error).echo_flags(async_call, oneway),
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("service method panicked: {}", detail)
}
