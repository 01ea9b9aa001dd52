pub mod envelope;
pub mod error;
pub mod header;
pub mod requests;
pub mod responses;


pub use envelope::{RpcFrame, RpcProtocol};
pub use error::{Result, RpcError};
pub use header::{
    next_request_id, MsgType, RpcHeader, RpcStatus, HEADER_TOTAL_LEN, MAGIC,
    SERIALIZATION_TYPE_LEN,
};
pub use requests::{MethodName, RequestId, RpcRequest, RpcValue, ServiceKey};
pub use responses::RpcResponse;
