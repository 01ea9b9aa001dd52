//! Kestrel Provider
//!
//! This crate provides the provider side of kestrel: it accepts consumer
//! connections, dispatches decoded requests to a bounded worker pool, invokes
//! the registered service method and writes the response back.
//!
//! - [`RpcServer`]: accept loop and per-connection handling
//! - [`ServiceRegistry`] / [`ServiceInstance`]: the `class#version#group` to
//!   implementation map the provider serves
//! - [`Invoker`]: how a method is resolved and called, with a dynamic and a
//!   cached strategy

pub mod config;
pub mod demo;
pub mod handler;
pub mod invoker;
pub mod server;
pub mod service;

pub use config::{InvokerKind, ProviderConfig, DEFAULT_BIND_ADDR};
pub use handler::RequestHandler;
pub use invoker::{invoker_for, CachedInvoker, DynamicInvoker, Invoker};
pub use server::{RpcServer, ServerHandle};
pub use service::{ServiceInstance, ServiceMethod, ServiceRegistry};
