use super::{RpcHeader, RpcRequest, RpcResponse};

/// A header paired with a typed body.
///
/// The envelope owns both parts for the lifetime of a single exchange and is
/// never pooled.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcProtocol<T> {
    pub header: RpcHeader,
    pub body: T,
}

impl<T> RpcProtocol<T> {
    pub fn new(header: RpcHeader, body: T) -> Self {
        Self { header, body }
    }

    pub fn request_id(&self) -> super::RequestId {
        self.header.request_id
    }

    pub fn into_parts(self) -> (RpcHeader, T) {
        (self.header, self.body)
    }
}

impl RpcProtocol<RpcRequest> {
    /// Wraps a request body in a fresh REQUEST header.
    pub fn request(serialization_type: &str, body: RpcRequest) -> Self {
        Self::new(RpcHeader::request(serialization_type), body)
    }
}

/// One item produced by the frame decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Request(RpcProtocol<RpcRequest>),
    Response(RpcProtocol<RpcResponse>),
    Heartbeat(RpcHeader),
    /// A complete frame whose body could not be deserialized.
    ///
    /// The bytes were consumed, so the stream stays aligned; the header is kept
    /// so the runtime can report the failure against the right request id.
    Undecodable { header: RpcHeader, reason: String },
}

impl RpcFrame {
    pub fn header(&self) -> &RpcHeader {
        match self {
            RpcFrame::Request(p) => &p.header,
            RpcFrame::Response(p) => &p.header,
            RpcFrame::Heartbeat(h) => h,
            RpcFrame::Undecodable { header, .. } => header,
        }
    }
}
