//! Kestrel Frame Header
//!
//! Every frame on the wire starts with a fixed 32-byte header, written in
//! network byte order:
//!
//! ```text
//! +--------------------------------------------------------------------+
//! | magic 2 | msg type 1 | status 1 |          request id 8            |
//! +--------------------------------------------------------------------+
//! |        serialization type 16 (zero padded)     |  body length 4    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! The body length is only known once the body has been serialized, so the
//! codec fills it in at encode time; the value stored in [`RpcHeader`] is
//! whatever the decoder last read.

use std::sync::atomic::{AtomicU64, Ordering};

use super::RequestId;

/// Protocol identity check at the start of every frame.
pub const MAGIC: u16 = 0x4b52;

/// Total size of the fixed header in bytes.
pub const HEADER_TOTAL_LEN: usize = 32;

/// Width of the serialization type field. Shorter names are padded with `0x00`.
pub const SERIALIZATION_TYPE_LEN: usize = 16;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a fresh, process-wide unique request id.
///
/// Ids start at 1 and are strictly increasing in the order the calls are
/// linearized by the atomic counter.
pub fn next_request_id() -> RequestId {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Request = 1,
    Response = 2,
    Heartbeat = 3,
}

impl MsgType {
    /// Maps a wire value to a message type, `None` for kinds this build does not know.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Outcome carried in a response header.
///
/// `Pending` is the value of every header that has not been answered yet. It
/// is deliberately distinct from `Success` so a fresh header can never be
/// mistaken for a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcStatus {
    Success = 0,
    Fail = 1,
    Pending = 0xff,
}

impl RpcStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Fail),
            0xff => Some(Self::Pending),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub magic: u16,
    pub msg_type: MsgType,
    pub status: RpcStatus,
    pub request_id: RequestId,
    /// Name of the serializer used for the body (at most 16 ASCII bytes).
    pub serialization_type: String,
    /// Body length as read from the wire. Ignored on encode.
    pub body_len: u32,
}

impl RpcHeader {
    /// Creates a REQUEST header with a fresh request id.
    ///
    /// # Example
    ///
    /// ```
    /// use kestrel_common::protocol::{RpcHeader, MsgType, RpcStatus, MAGIC};
    ///
    /// let header = RpcHeader::request("json");
    /// assert_eq!(header.magic, MAGIC);
    /// assert_eq!(header.msg_type, MsgType::Request);
    /// assert_eq!(header.status, RpcStatus::Pending);
    /// ```
    pub fn request(serialization_type: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            msg_type: MsgType::Request,
            status: RpcStatus::Pending,
            request_id: next_request_id(),
            serialization_type: serialization_type.into(),
            body_len: 0,
        }
    }

    /// Creates a HEARTBEAT header. Heartbeats carry an empty body.
    pub fn heartbeat(serialization_type: impl Into<String>) -> Self {
        Self {
            msg_type: MsgType::Heartbeat,
            ..Self::request(serialization_type)
        }
    }

    /// Turns this header into the header of the matching response.
    ///
    /// The request id and serialization type are kept so the consumer can
    /// correlate and decode the reply.
    pub fn into_response(mut self, status: RpcStatus) -> Self {
        self.msg_type = MsgType::Response;
        self.status = status;
        self
    }
}
