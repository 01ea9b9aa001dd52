//! Kestrel Consumer
//!
//! This crate provides the consumer side of kestrel: it sends requests to a
//! provider and matches the responses back to the calls that made them.
//!
//! - [`RpcConsumer`]: connection cache and the three call modes (sync, async, oneway)
//! - [`ConsumerConnection`]: one provider connection and its pending-call table
//! - [`RpcFuture`]: the handle a tracked call completes through, with callbacks

pub mod config;
pub mod connection;
pub mod consumer;
pub mod future;

pub use config::ConsumerConfig;
pub use connection::ConsumerConnection;
pub use consumer::{CallOutcome, RpcConsumer};
pub use future::{FnCallback, RpcCallback, RpcFuture, SLOW_RESPONSE_THRESHOLD};
