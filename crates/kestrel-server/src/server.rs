//! Kestrel provider server.
//!
//! # Architecture
//!
//! The server:
//! - Accepts TCP connections and spawns a tokio task for each
//! - Decodes request frames on the connection task
//! - Submits each request to a bounded [`WorkerPool`] so slow service methods
//!   never stall the connection that delivered them
//! - Hands finished responses to a per-connection writer task
//!
//! Every request gets a response, oneway calls included. Application
//! failures travel in the response body; only framing errors close a
//! connection.
//!
//! # Example
//!
//! ```no_run
//! use kestrel_server::{demo, ProviderConfig, RpcServer};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RpcServer::bind(ProviderConfig::default(), demo::registry()).await?;
//! let handle = server.spawn();
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use kestrel_common::threadpool::WorkerPool;
use kestrel_common::transport::RpcCodec;
use kestrel_common::{MsgType, Result, RpcError, RpcFrame, RpcProtocol, RpcRequest, RpcResponse};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::handler::{failure_response, RequestHandler};
use crate::invoker::invoker_for;
use crate::service::ServiceRegistry;

/// A bound provider, ready to serve.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    codec: RpcCodec,
    handler: Arc<RequestHandler>,
    pool: Arc<WorkerPool>,
}

impl RpcServer {
    /// Binds the listener and starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address cannot
    /// be bound.
    pub async fn bind(config: ProviderConfig, registry: ServiceRegistry) -> Result<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))?;
        let pool = Arc::new(WorkerPool::new("provider", config.pool.clone())?);
        let invoker = invoker_for(config.invoker);
        let handler = Arc::new(RequestHandler::new(Arc::new(registry), invoker));

        tracing::info!(
            addr = %local_addr,
            invoker = %config.invoker,
            services = handler.registry().len(),
            "Provider listening"
        );

        Ok(Self {
            listener,
            local_addr,
            codec: RpcCodec::with_max_frame_len(config.max_frame_len),
            handler,
            pool,
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves in a background task.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.serve(shutdown.clone()));
        ServerHandle {
            local_addr,
            shutdown,
            task,
        }
    }

    /// Serves until the accept loop fails.
    pub async fn run(self) -> Result<()> {
        self.serve(CancellationToken::new()).await
    }

    async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(peer = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
            }

            tracing::debug!(peer = %peer_addr, "Connection established");
            tokio::spawn(serve_connection(
                stream,
                peer_addr,
                self.codec.clone(),
                self.handler.clone(),
                self.pool.clone(),
                shutdown.child_token(),
            ));
        }

        tracing::info!("Provider stopped accepting connections");
        Ok(())
    }
}

/// Handle to a server started with [`RpcServer::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, ends every open connection and waits for the accept
    /// loop to exit. Requests already running still finish on the pool.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| RpcError::Connection(format!("Provider task failed: {}", e)))?
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    codec: RpcCodec,
    handler: Arc<RequestHandler>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);
    let (responses, mut outgoing) = mpsc::unbounded_channel::<RpcProtocol<RpcResponse>>();

    tokio::spawn(async move {
        while let Some(response) = outgoing.recv().await {
            if let Err(e) = write_response(&mut writer, response, peer_addr).await {
                tracing::error!(peer = %peer_addr, "Failed to write response: {}", e);
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            None => {
                tracing::debug!(peer = %peer_addr, "Connection closed by peer");
                break;
            }
            Some(Err(e)) => {
                tracing::error!(peer = %peer_addr, "Closing connection: {}", e);
                break;
            }
            Some(Ok(RpcFrame::Request(request))) => dispatch(request, &handler, &pool, &responses),
            Some(Ok(RpcFrame::Undecodable { header, reason }))
                if header.msg_type == MsgType::Request =>
            {
                let _ = responses.send(failure_response(
                    header,
                    false,
                    false,
                    format!("undecodable request: {}", reason),
                ));
            }
            Some(Ok(RpcFrame::Undecodable { header, reason })) => {
                tracing::warn!(
                    peer = %peer_addr,
                    request_id = header.request_id,
                    msg_type = ?header.msg_type,
                    "Ignoring undecodable non-request frame: {}",
                    reason
                );
            }
            Some(Ok(RpcFrame::Heartbeat(header))) => {
                tracing::debug!(peer = %peer_addr, request_id = header.request_id, "Heartbeat received");
            }
            Some(Ok(RpcFrame::Response(response))) => {
                tracing::warn!(
                    peer = %peer_addr,
                    request_id = response.request_id(),
                    "Ignoring response frame on a provider connection"
                );
            }
        }
    }
}

/// Writes one response.
///
/// A response that cannot be encoded, such as a result larger than the frame
/// limit, is replaced by a FAIL response carrying the encode error. Only I/O
/// errors are returned.
async fn write_response(
    writer: &mut FramedWrite<OwnedWriteHalf, RpcCodec>,
    response: RpcProtocol<RpcResponse>,
    peer_addr: SocketAddr,
) -> Result<()> {
    let request_id = response.request_id();
    let header = response.header.clone();
    let (async_call, oneway) = (response.body.async_call, response.body.oneway);

    match writer.send(response).await {
        Ok(()) => {}
        Err(e @ RpcError::Io(_)) => return Err(e),
        Err(e) => {
            tracing::warn!(peer = %peer_addr, request_id, "Response could not be encoded: {}", e);
            let fallback = failure_response(header, async_call, oneway, e.to_string());
            match writer.send(fallback).await {
                Ok(()) => {}
                Err(e @ RpcError::Io(_)) => return Err(e),
                Err(e) => {
                    tracing::error!(peer = %peer_addr, request_id, "Dropping response: {}", e);
                    return Ok(());
                }
            }
        }
    }
    tracing::debug!(peer = %peer_addr, request_id, "Response sent");
    Ok(())
}

fn dispatch(
    request: RpcProtocol<RpcRequest>,
    handler: &Arc<RequestHandler>,
    pool: &WorkerPool,
    responses: &mpsc::UnboundedSender<RpcProtocol<RpcResponse>>,
) {
    let header = request.header.clone();
    let (async_call, oneway) = (request.body.async_call, request.body.oneway);
    tracing::debug!(
        request_id = header.request_id,
        service = %request.body.service_key(),
        method = %request.body.method_name,
        "Dispatching request"
    );

    let handler = handler.clone();
    let job_responses = responses.clone();
    let submitted = pool.submit(move || {
        let response = handler.handle(request);
        // The connection may be gone by now
        let _ = job_responses.send(response);
    });

    if let Err(e) = submitted {
        let _ = responses.send(failure_response(header, async_call, oneway, e.to_string()));
    }
}
