//! Kestrel Common Types and Transport
//!
//! This crate provides the wire protocol, frame codec and shared runtime
//! pieces used by the kestrel consumer and provider.
//!
//! # Overview
//!
//! Kestrel is a small RPC framework: a consumer turns a method call into a
//! request frame, a provider decodes it, invokes the registered service
//! method and answers with a response frame that the consumer matches back to
//! the waiting call by request id.
//!
//! - **Protocol Layer**: frame header, request/response bodies, envelopes and errors
//! - **Transport Layer**: streaming frame codec, body serializers and TCP connect
//! - **Thread Pool**: bounded worker pool used for service invocation and callbacks
//!
//! # Wire Format
//!
//! ```text
//! magic(2) | msgType(1) | status(1) | requestId(8) | serializationType(16) | bodyLength(4) | body
//! ```
//!
//! All integers are big-endian; the serialization type is zero padded.
//!
//! # Example
//!
//! ```
//! use kestrel_common::{RpcProtocol, RpcRequest, RpcResponse};
//! use serde_json::json;
//!
//! // Build a request envelope with a fresh header
//! let request = RpcProtocol::request(
//!     "json",
//!     RpcRequest::new("DemoService", "sayHello")
//!         .with_parameter("String", json!("lizhe"))
//!         .with_version("1.0.0")
//!         .with_group("test"),
//! );
//! assert_eq!(request.body.service_key().as_str(), "DemoService#1.0.0#test");
//!
//! // What the provider answers with
//! let response = RpcResponse::success(json!("Hello lizhe"));
//! assert!(!response.is_error());
//! ```

pub mod protocol;
pub mod threadpool;
pub mod transport;

pub use protocol::*;
