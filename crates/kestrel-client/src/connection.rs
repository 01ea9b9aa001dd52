use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kestrel_common::threadpool::WorkerPool;
use kestrel_common::transport::{map_io_error, RpcCodec, TcpTransport};
use kestrel_common::{
    RequestId, Result, RpcError, RpcFrame, RpcHeader, RpcProtocol, RpcRequest, RpcResponse,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::future::RpcFuture;

type PendingTable = DashMap<RequestId, RpcFuture>;

/// One consumer connection to a provider.
///
/// Owns the connection's pending-call table: a request is registered before
/// its frame is written and removed exactly once, when its response arrives,
/// when the write fails, when a sync caller gives up or when the reaper evicts
/// it. A reader task decodes responses and completes the matching futures, so
/// responses may arrive in any order.
///
/// When the connection ends for any reason, every call still pending on it is
/// failed with a synthesized error response.
pub struct ConsumerConnection {
    addr: String,
    serialization_type: String,
    writer: Mutex<FramedWrite<OwnedWriteHalf, RpcCodec>>,
    pending: Arc<PendingTable>,
    active: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    callback_pool: Arc<WorkerPool>,
}

impl ConsumerConnection {
    /// Connects to `addr` and starts the reader task.
    pub async fn connect(
        addr: &str,
        transport: &TcpTransport,
        serialization_type: &str,
        callback_pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        let stream = transport.connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(PendingTable::new());
        let active = Arc::new(AtomicBool::new(true));

        let reader = FramedRead::new(read_half, transport.codec());
        let reader = tokio::spawn(read_responses(
            addr.to_string(),
            reader,
            pending.clone(),
            active.clone(),
        ));

        tracing::info!(addr = %addr, "Connected to provider");

        Ok(Self {
            addr: addr.to_string(),
            serialization_type: serialization_type.to_string(),
            writer: Mutex::new(FramedWrite::new(write_half, transport.codec())),
            pending,
            active,
            reader,
            callback_pool,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the connection can still carry requests.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Registers a future for the request, then writes it.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the connection is closed or the write
    /// fails. The pending entry is removed before the error is returned.
    pub async fn send_tracked(&self, request: RpcProtocol<RpcRequest>) -> Result<RpcFuture> {
        self.ensure_active()?;
        let request_id = request.request_id();
        let future = RpcFuture::new(Arc::new(request.clone()), self.callback_pool.clone());
        self.register(future.clone())?;

        if let Err(e) = self.write(request).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Writes a request without registering anything.
    ///
    /// Whatever the provider answers is dropped by the reader as unmatched.
    pub async fn send_oneway(&self, request: RpcProtocol<RpcRequest>) -> Result<()> {
        self.ensure_active()?;
        self.write(request).await
    }

    /// Removes a pending entry, returning its future if it was still there.
    pub fn remove_pending(&self, request_id: RequestId) -> Option<RpcFuture> {
        self.pending.remove(&request_id).map(|(_, future)| future)
    }

    /// Fails and removes every pending call older than `ttl`.
    ///
    /// Returns the number of evicted calls.
    pub fn reap_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().elapsed() > ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for request_id in expired {
            if let Some((_, future)) = self.pending.remove(&request_id) {
                tracing::warn!(
                    addr = %self.addr,
                    request_id,
                    elapsed_ms = future.elapsed().as_millis() as u64,
                    "Evicting pending call with no response"
                );
                future.fail(future.timeout_error().to_string());
                evicted += 1;
            }
        }
        evicted
    }

    /// Writes a final heartbeat frame, flushes and shuts the write half down.
    ///
    /// The provider sees end of stream and closes its side; the reader task
    /// then fails whatever is still pending.
    pub async fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(RpcHeader::heartbeat(self.serialization_type.as_str()))
            .await?;
        writer
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| map_io_error(e, "closing connection"))?;
        tracing::info!(addr = %self.addr, "Connection closed");
        Ok(())
    }

    /// Adds a future to the pending table.
    ///
    /// The reader clears the active flag before failing everything pending,
    /// so an entry that lands after the flag is cleared is taken back out
    /// here instead of waiting for the reaper.
    fn register(&self, future: RpcFuture) -> Result<()> {
        let request_id = future.request_id();
        if self.pending.insert(request_id, future).is_some() {
            tracing::error!(request_id, "Duplicate request id in pending table");
        }
        if !self.active.load(Ordering::SeqCst) {
            self.pending.remove(&request_id);
            return Err(RpcError::Connection(format!(
                "connection to {} closed while sending the request",
                self.addr
            )));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RpcError::Connection(format!("connection to {} is not active", self.addr)))
        }
    }

    async fn write(&self, request: RpcProtocol<RpcRequest>) -> Result<()> {
        let request_id = request.request_id();
        let mut writer = self.writer.lock().await;
        writer.send(request).await.map_err(|e| {
            tracing::error!(addr = %self.addr, request_id, "Failed to send request: {}", e);
            match e {
                RpcError::Io(io) => map_io_error(io, "sending request"),
                other => other,
            }
        })?;
        tracing::debug!(addr = %self.addr, request_id, "Request sent");
        Ok(())
    }
}

impl Drop for ConsumerConnection {
    fn drop(&mut self) {
        self.reader.abort();
        fail_all(&self.addr, &self.pending);
    }
}

async fn read_responses(
    addr: String,
    mut reader: FramedRead<OwnedReadHalf, RpcCodec>,
    pending: Arc<PendingTable>,
    active: Arc<AtomicBool>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(RpcFrame::Response(response)) => complete(&addr, &pending, response),
            Ok(RpcFrame::Undecodable { header, reason }) => {
                match pending.remove(&header.request_id) {
                    Some((_, future)) => {
                        future.fail(format!("undecodable response: {}", reason));
                    }
                    None => tracing::warn!(
                        addr = %addr,
                        request_id = header.request_id,
                        "Undecodable response for unknown request: {}",
                        reason
                    ),
                }
            }
            Ok(RpcFrame::Heartbeat(header)) => {
                tracing::debug!(addr = %addr, request_id = header.request_id, "Heartbeat received");
            }
            Ok(RpcFrame::Request(request)) => {
                tracing::warn!(
                    addr = %addr,
                    request_id = request.request_id(),
                    "Ignoring request frame on a consumer connection"
                );
            }
            Err(e) => {
                tracing::error!(addr = %addr, "Closing connection: {}", e);
                break;
            }
        }
    }

    active.store(false, Ordering::SeqCst);
    fail_all(&addr, &pending);
    tracing::debug!(addr = %addr, "Reader stopped");
}

fn complete(addr: &str, pending: &PendingTable, response: RpcProtocol<RpcResponse>) {
    let request_id = response.request_id();
    match pending.remove(&request_id) {
        Some((_, future)) => {
            tracing::debug!(addr = %addr, request_id, "Response received");
            future.complete(response);
        }
        None => {
            tracing::debug!(addr = %addr, request_id, "No pending call for response, dropping");
        }
    }
}

fn fail_all(addr: &str, pending: &PendingTable) {
    let request_ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    for request_id in request_ids {
        if let Some((_, future)) = pending.remove(&request_id) {
            future.fail(format!("connection to {} closed before the response arrived", addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use kestrel_common::threadpool::PoolConfig;
    use kestrel_common::{RpcStatus, RpcValue};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::codec::Encoder;

    const WAIT: Duration = Duration::from_secs(5);

    enum Reply {
        Response(RpcProtocol<RpcResponse>),
        Raw(BytesMut),
        Close,
    }

    /// Provider stand-in that forwards what it reads and writes what it is told.
    struct FakeProvider {
        addr: String,
        requests: mpsc::UnboundedReceiver<RpcFrame>,
        replies: mpsc::UnboundedSender<Reply>,
    }

    impl FakeProvider {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let (requests_tx, requests) = mpsc::unbounded_channel();
            let (replies, mut replies_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = FramedRead::new(read_half, RpcCodec::new());
                loop {
                    tokio::select! {
                        frame = reader.next() => match frame {
                            Some(Ok(frame)) => {
                                let _ = requests_tx.send(frame);
                            }
                            _ => break,
                        },
                        reply = replies_rx.recv() => match reply {
                            Some(Reply::Response(response)) => {
                                let mut buf = BytesMut::new();
                                RpcCodec::new().encode(response, &mut buf).unwrap();
                                write_half.write_all(&buf).await.unwrap();
                            }
                            Some(Reply::Raw(buf)) => write_half.write_all(&buf).await.unwrap(),
                            Some(Reply::Close) | None => break,
                        },
                    }
                }
            });

            Self {
                addr,
                requests,
                replies,
            }
        }

        async fn next_request(&mut self) -> RpcProtocol<RpcRequest> {
            match tokio::time::timeout(WAIT, self.requests.recv()).await.unwrap() {
                Some(RpcFrame::Request(request)) => request,
                other => panic!("expected a request, got {:?}", other),
            }
        }

        fn answer(&self, request: &RpcProtocol<RpcRequest>, result: RpcValue) {
            let header = request.header.clone().into_response(RpcStatus::Success);
            let body = RpcResponse::success(result);
            let _ = self.replies.send(Reply::Response(RpcProtocol::new(header, body)));
        }
    }

    async fn connect(addr: &str) -> ConsumerConnection {
        let pool = Arc::new(WorkerPool::new("callbacks", PoolConfig::new(2, 64)).unwrap());
        ConsumerConnection::connect(addr, &TcpTransport::new(), "json", pool)
            .await
            .unwrap()
    }

    fn say_hello(name: &str) -> RpcProtocol<RpcRequest> {
        RpcProtocol::request(
            "json",
            RpcRequest::new("DemoService", "sayHello")
                .with_parameter("String", json!(name))
                .with_version("1.0.0")
                .with_group("test"),
        )
    }

    #[tokio::test]
    async fn test_response_completes_pending_call() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        assert!(conn.is_pending(future.request_id()));

        let request = provider.next_request().await;
        assert_eq!(request.request_id(), future.request_id());
        assert_eq!(request.body.service_key().as_str(), "DemoService#1.0.0#test");
        provider.answer(&request, json!("Hello lizhe"));

        assert_eq!(future.get(WAIT).await.unwrap(), Some(json!("Hello lizhe")));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let first = conn.send_tracked(say_hello("first")).await.unwrap();
        let second = conn.send_tracked(say_hello("second")).await.unwrap();
        let first_request = provider.next_request().await;
        let second_request = provider.next_request().await;

        provider.answer(&second_request, json!("Hello second"));
        assert_eq!(second.get(WAIT).await.unwrap(), Some(json!("Hello second")));
        assert!(!first.is_done());

        provider.answer(&first_request, json!("Hello first"));
        assert_eq!(first.get(WAIT).await.unwrap(), Some(json!("Hello first")));
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_ignored() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        let request = provider.next_request().await;

        let mut stray = request.clone();
        stray.header.request_id = u64::MAX;
        provider.answer(&stray, json!("nobody asked"));
        provider.answer(&request, json!("Hello lizhe"));

        assert_eq!(future.get(WAIT).await.unwrap(), Some(json!("Hello lizhe")));
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_oneway_creates_no_pending_entry() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        conn.send_oneway(say_hello("lizhe").map_oneway()).await.unwrap();
        assert_eq!(conn.pending_count(), 0);

        // The provider still answers; the response is unmatched and dropped
        let request = provider.next_request().await;
        assert!(request.body.oneway);
        provider.answer(&request, json!("Hello lizhe"));

        let future = conn.send_tracked(say_hello("again")).await.unwrap();
        let request = provider.next_request().await;
        provider.answer(&request, json!("Hello again"));
        assert_eq!(future.get(WAIT).await.unwrap(), Some(json!("Hello again")));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_calls() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        provider.next_request().await;
        let _ = provider.replies.send(Reply::Close);

        let response = tokio::time::timeout(WAIT, future.wait()).await.unwrap();
        assert_eq!(response.header.status, RpcStatus::Fail);
        assert!(response.body.error.as_deref().unwrap().contains("closed"));
        assert_eq!(conn.pending_count(), 0);

        tokio::time::timeout(WAIT, async {
            while conn.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let err = conn.send_tracked(say_hello("late")).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_undecodable_response_fails_matching_call() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        let request = provider.next_request().await;

        let header = request.header.clone().into_response(RpcStatus::Success);
        let mut buf = BytesMut::new();
        RpcCodec::new()
            .encode_frame(&header, &json!("not a response"), &mut buf)
            .unwrap();
        let _ = provider.replies.send(Reply::Raw(buf));

        let err = future.get(WAIT).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("undecodable")));
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_unknown_response_status_fails_matching_call() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        let request = provider.next_request().await;

        let header = request.header.clone().into_response(RpcStatus::Success);
        let mut buf = BytesMut::new();
        RpcCodec::new()
            .encode(RpcProtocol::new(header, RpcResponse::success(json!("Hello lizhe"))), &mut buf)
            .unwrap();
        buf[3] = 0x02;
        let _ = provider.replies.send(Reply::Raw(buf));

        let err = future.get(WAIT).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("unknown response status")), "{:?}", err);
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_register_after_reader_stopped_is_refused() {
        let provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        // The reader has cleared the flag but the caller already passed its check
        conn.active.store(false, Ordering::SeqCst);
        let future = RpcFuture::new(Arc::new(say_hello("late")), conn.callback_pool.clone());
        let err = conn.register(future.clone()).unwrap_err();

        assert!(matches!(err, RpcError::Connection(_)));
        assert_eq!(conn.pending_count(), 0);
        assert!(!future.is_done());
    }

    #[tokio::test]
    async fn test_reap_expired_fails_old_calls() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        let future = conn.send_tracked(say_hello("lizhe")).await.unwrap();
        provider.next_request().await;

        assert_eq!(conn.reap_expired(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.reap_expired(Duration::from_millis(10)), 1);

        let err = future.get(WAIT).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("Timeout exception")));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_sends_heartbeat_and_rejects_new_calls() {
        let mut provider = FakeProvider::start().await;
        let conn = connect(&provider.addr).await;

        conn.close().await.unwrap();
        assert!(!conn.is_active());

        let frame = tokio::time::timeout(WAIT, provider.requests.recv()).await.unwrap();
        assert!(matches!(frame, Some(RpcFrame::Heartbeat(_))));

        let err = conn.send_oneway(say_hello("late")).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
        // Closing twice is a no-op
        conn.close().await.unwrap();
    }

    trait OnewayExt {
        fn map_oneway(self) -> Self;
    }

    impl OnewayExt for RpcProtocol<RpcRequest> {
        fn map_oneway(mut self) -> Self {
            self.body.oneway = true;
            self
        }
    }
}
