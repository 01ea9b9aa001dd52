use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{
    MsgType, RpcFrame, RpcHeader, RpcProtocol, RpcStatus, HEADER_TOTAL_LEN, MAGIC,
    SERIALIZATION_TYPE_LEN,
};
use crate::transport::serialization::{validate_type_name, Serialization};

/// Default upper bound for a frame body (16 MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Checks a configured body limit: non-zero and expressible in the header's
/// 32-bit `bodyLength` field.
pub fn validate_max_frame_len(max_frame_len: usize) -> Result<()> {
    if max_frame_len == 0 {
        return Err(RpcError::InvalidConfig(
            "max frame length must be greater than zero".to_string(),
        ));
    }
    if u32::try_from(max_frame_len).is_err() {
        return Err(RpcError::InvalidConfig(format!(
            "max frame length {} exceeds the {} byte limit of the wire header",
            max_frame_len,
            u32::MAX
        )));
    }
    Ok(())
}

/// Streaming codec for kestrel frames.
///
/// The decoder is partial-frame aware: it never consumes bytes until a whole
/// frame (header and body) is buffered, so a frame split across any number of
/// transport reads is reassembled without loss. Several frames arriving in one
/// read are yielded one per call.
///
/// Wire format: `[32-byte header] + [body]`, see [`crate::protocol::header`].
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use kestrel_common::protocol::{RpcFrame, RpcProtocol, RpcRequest};
/// use kestrel_common::transport::RpcCodec;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = RpcCodec::new();
/// let request = RpcProtocol::request("json", RpcRequest::new("DemoService", "sayHello"));
///
/// let mut buf = BytesMut::new();
/// codec.encode(request.clone(), &mut buf).unwrap();
///
/// match codec.decode(&mut buf).unwrap() {
///     Some(RpcFrame::Request(decoded)) => assert_eq!(decoded.body, request.body),
///     other => panic!("unexpected frame: {:?}", other),
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RpcCodec {
    max_frame_len: usize,
}

impl RpcCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Creates a codec that rejects bodies larger than `max_frame_len` bytes.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encodes one frame into `dst`.
    ///
    /// The body is serialized before anything is written, so a serialization
    /// failure leaves `dst` untouched. Heartbeat frames are written with an
    /// empty body.
    pub fn encode_frame<T: Serialize>(
        &self,
        header: &RpcHeader,
        body: &T,
        dst: &mut BytesMut,
    ) -> Result<()> {
        validate_type_name(&header.serialization_type)
            .map_err(|e| RpcError::Serialization(e.to_string()))?;

        let data = match header.msg_type {
            MsgType::Heartbeat => Vec::new(),
            _ => Serialization::from_type(&header.serialization_type)?.serialize(body)?,
        };

        if data.len() > self.max_frame_len {
            return Err(RpcError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_len,
            });
        }

        let body_len = u32::try_from(data.len()).map_err(|_| RpcError::FrameTooLarge {
            size: data.len(),
            max: u32::MAX as usize,
        })?;

        let name = header.serialization_type.as_bytes();
        dst.reserve(HEADER_TOTAL_LEN + data.len());
        dst.put_u16(MAGIC);
        dst.put_u8(header.msg_type.as_u8());
        dst.put_u8(header.status.as_u8());
        dst.put_u64(header.request_id);
        dst.put_slice(name);
        dst.put_bytes(0, SERIALIZATION_TYPE_LEN - name.len());
        dst.put_u32(body_len);
        dst.put_slice(&data);

        Ok(())
    }

    /// Builds the typed item for one complete frame.
    ///
    /// Returns `None` for frames with an unknown message kind; those may come
    /// from a newer peer and are not fatal. The status byte only carries
    /// meaning on responses: requests and heartbeats accept any value, while
    /// a response with an unknown status is undecodable.
    fn parse_frame(&self, raw: RawHeader, body: &[u8]) -> Option<RpcFrame> {
        let Some(msg_type) = MsgType::from_u8(raw.msg_type) else {
            tracing::warn!(
                request_id = raw.request_id,
                msg_type = raw.msg_type,
                "Dropping frame with unknown message type"
            );
            return None;
        };
        let known_status = RpcStatus::from_u8(raw.status);
        let status = known_status.unwrap_or(match msg_type {
            MsgType::Response => RpcStatus::Fail,
            _ => RpcStatus::Pending,
        });

        let header = RpcHeader {
            magic: raw.magic,
            msg_type,
            status,
            request_id: raw.request_id,
            serialization_type: trim_padding(&raw.serialization_type),
            body_len: raw.body_len,
        };

        if known_status.is_none() && msg_type == MsgType::Response {
            tracing::warn!(
                request_id = header.request_id,
                status = raw.status,
                "Response with unknown status"
            );
            return Some(RpcFrame::Undecodable {
                header,
                reason: format!("unknown response status {:#04x}", raw.status),
            });
        }

        let decoded = match msg_type {
            MsgType::Heartbeat => return Some(RpcFrame::Heartbeat(header)),
            MsgType::Request => Serialization::from_type(&header.serialization_type)
                .and_then(|s| s.deserialize(body))
                .map(|request| RpcFrame::Request(RpcProtocol::new(header.clone(), request))),
            MsgType::Response => Serialization::from_type(&header.serialization_type)
                .and_then(|s| s.deserialize(body))
                .map(|response| RpcFrame::Response(RpcProtocol::new(header.clone(), response))),
        };

        match decoded {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(
                    request_id = header.request_id,
                    error = %e,
                    "Failed to deserialize frame body"
                );
                Some(RpcFrame::Undecodable {
                    header,
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Header fields as read from the wire, before validation.
struct RawHeader {
    magic: u16,
    msg_type: u8,
    status: u8,
    request_id: u64,
    serialization_type: [u8; SERIALIZATION_TYPE_LEN],
    body_len: u32,
}

impl RawHeader {
    fn read(mut buf: &[u8]) -> Self {
        let magic = buf.get_u16();
        let msg_type = buf.get_u8();
        let status = buf.get_u8();
        let request_id = buf.get_u64();
        let mut serialization_type = [0u8; SERIALIZATION_TYPE_LEN];
        buf.copy_to_slice(&mut serialization_type);
        let body_len = buf.get_u32();
        Self {
            magic,
            msg_type,
            status,
            request_id,
            serialization_type,
            body_len,
        }
    }
}

/// Strips the `0x00` padding from the serialization type field.
fn trim_padding(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl Decoder for RpcCodec {
    type Item = RpcFrame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcFrame>> {
        loop {
            if src.len() < HEADER_TOTAL_LEN {
                return Ok(None);
            }

            // Peek at the header; nothing is consumed until the body is buffered too.
            let raw = RawHeader::read(&src[..HEADER_TOTAL_LEN]);
            if raw.magic != MAGIC {
                return Err(RpcError::InvalidMagic(raw.magic));
            }

            let body_len = raw.body_len as usize;
            if body_len > self.max_frame_len {
                return Err(RpcError::FrameTooLarge {
                    size: body_len,
                    max: self.max_frame_len,
                });
            }

            let frame_len = HEADER_TOTAL_LEN + body_len;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_TOTAL_LEN);
            let body = src.split_to(body_len);

            if let Some(frame) = self.parse_frame(raw, &body) {
                return Ok(Some(frame));
            }
            // Dropped frame: keep going with whatever is still buffered.
        }
    }
}

impl<T: Serialize> Encoder<RpcProtocol<T>> for RpcCodec {
    type Error = RpcError;

    fn encode(&mut self, item: RpcProtocol<T>, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&item.header, &item.body, dst)
    }
}

impl Encoder<RpcHeader> for RpcCodec {
    type Error = RpcError;

    /// Encodes a body-less frame, used for heartbeats.
    fn encode(&mut self, header: RpcHeader, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&header, &(), dst)
    }
}
