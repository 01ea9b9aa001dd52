//! Kestrel Transport Layer
//!
//! This module provides the frame codec, body serializers and TCP transport.
//!
//! # Architecture
//!
//! - **Transport**: long-lived TCP connections, multiplexed by request id
//! - **Codec**: [`RpcCodec`], a streaming decoder/encoder for 32-byte-header frames
//! - **Serialization**: [`Serialization`], selected per frame by the header's
//!   serialization type field
//! - **Wire Format**: `[32-byte header] + [body]`, all integers big-endian
//!
//! # Frame Size Limits
//!
//! The codec rejects frames whose declared body length exceeds its configured
//! maximum (16 MB by default). A peer that sends one is treated as broken and
//! the connection is closed.

pub mod codec;
pub mod serialization;
pub mod tcp;

pub use codec::{validate_max_frame_len, RpcCodec, DEFAULT_MAX_FRAME_LEN};
pub use serialization::{validate_type_name, JsonSerialization, Serialization};
pub use tcp::{map_io_error, TcpTransport, DEFAULT_CONNECT_TIMEOUT};
