use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_common::threadpool::WorkerPool;
use kestrel_common::transport::TcpTransport;
use kestrel_common::{Result, RpcError, RpcProtocol, RpcRequest, RpcValue};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ConsumerConfig;
use crate::connection::ConsumerConnection;
use crate::future::RpcFuture;

type ConnectionCache = Mutex<HashMap<String, Arc<ConsumerConnection>>>;

/// What [`RpcConsumer::send_request`] hands back, depending on the call mode.
#[derive(Debug)]
pub enum CallOutcome {
    /// Sync call: the provider's result.
    Completed(Option<RpcValue>),
    /// Async call: a handle to wait on or attach callbacks to.
    Async(RpcFuture),
    /// Oneway call: nothing to wait for.
    Oneway,
}

/// Kestrel consumer.
///
/// Turns requests into frames on a cached connection per provider address and
/// correlates the responses. Connections are created lazily on first use and
/// replaced when the cached one is no longer active.
///
/// The consumer owns a callback pool for async completions and a reaper task
/// that evicts calls left pending longer than the configured TTL. Both stop
/// on [`close`](Self::close).
///
/// # Example
///
/// ```rust,no_run
/// use kestrel_client::{ConsumerConfig, RpcConsumer};
/// use kestrel_common::RpcRequest;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let consumer = RpcConsumer::new(ConsumerConfig::default())?;
///
/// let request = RpcRequest::new("DemoService", "sayHello")
///     .with_parameter("String", json!("lizhe"))
///     .with_version("1.0.0")
///     .with_group("test");
/// let greeting = consumer.call_sync(request).await?;
/// assert_eq!(greeting, Some(json!("Hello lizhe")));
///
/// consumer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcConsumer {
    config: ConsumerConfig,
    transport: TcpTransport,
    connections: Arc<ConnectionCache>,
    callback_pool: Arc<WorkerPool>,
    reaper: JoinHandle<()>,
    closed: AtomicBool,
}

impl RpcConsumer {
    /// Creates a consumer on the current tokio runtime.
    ///
    /// No connection is opened until the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no runtime is running.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let callback_pool = Arc::new(WorkerPool::new("consumer-callbacks", config.callback_pool.clone())?);
        let transport = TcpTransport::new()
            .with_connect_timeout(config.connect_timeout)
            .with_max_frame_len(config.max_frame_len);
        let connections: Arc<ConnectionCache> = Arc::new(Mutex::new(HashMap::new()));

        let reaper = tokio::spawn(reap_pending(connections.clone(), config.clone()));

        Ok(Self {
            config,
            transport,
            connections,
            callback_pool,
            reaper,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Sends a request using the call mode its `oneway`/`async` flags select.
    ///
    /// - oneway: returns [`CallOutcome::Oneway`] once the frame is written
    /// - async: returns [`CallOutcome::Async`] with the pending future
    /// - otherwise waits up to the sync timeout and returns
    ///   [`CallOutcome::Completed`]
    ///
    /// # Errors
    ///
    /// - [`RpcError::Connection`](kestrel_common::RpcError::Connection) if the
    ///   provider cannot be reached or the write fails
    /// - [`RpcError::Timeout`](kestrel_common::RpcError::Timeout) if a sync call
    ///   gets no response in time
    /// - [`RpcError::Remote`](kestrel_common::RpcError::Remote) if the provider
    ///   answered a sync call with an error
    pub async fn send_request(&self, request: RpcRequest) -> Result<CallOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("consumer is closed".to_string()));
        }
        let addr = self.resolve_address(&request);
        let connection = self.connection(addr).await?;
        let envelope = RpcProtocol::request(self.config.serialization_type.as_str(), request);
        let request_id = envelope.request_id();
        tracing::debug!(
            request_id,
            class = %envelope.body.class_name,
            method = %envelope.body.method_name,
            oneway = envelope.body.oneway,
            async_call = envelope.body.async_call,
            "Sending request"
        );

        if envelope.body.oneway {
            connection.send_oneway(envelope).await?;
            return Ok(CallOutcome::Oneway);
        }

        let is_async = envelope.body.async_call;
        let future = connection.send_tracked(envelope).await?;
        if is_async {
            return Ok(CallOutcome::Async(future));
        }

        match future.get(self.config.sync_timeout).await {
            Ok(result) => Ok(CallOutcome::Completed(result)),
            Err(e) => {
                // A timed-out call must not stay in the table
                connection.remove_pending(request_id);
                Err(e)
            }
        }
    }

    /// Sends a request and waits for its result.
    pub async fn call_sync(&self, request: RpcRequest) -> Result<Option<RpcValue>> {
        match self
            .send_request(request.with_async(false).with_oneway(false))
            .await?
        {
            CallOutcome::Completed(result) => Ok(result),
            other => Err(RpcError::Protocol(format!("sync call returned {:?}", other))),
        }
    }

    /// Sends a request and returns its future without waiting.
    pub async fn call_async(&self, request: RpcRequest) -> Result<RpcFuture> {
        match self
            .send_request(request.with_async(true).with_oneway(false))
            .await?
        {
            CallOutcome::Async(future) => Ok(future),
            other => Err(RpcError::Protocol(format!("async call returned {:?}", other))),
        }
    }

    /// Sends a request and returns as soon as it is written.
    pub async fn call_oneway(&self, request: RpcRequest) -> Result<()> {
        self.send_request(request.with_async(false).with_oneway(true))
            .await
            .map(|_| ())
    }

    /// Number of calls pending across all cached connections.
    pub async fn pending_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .map(|connection| connection.pending_count())
            .sum()
    }

    /// Closes every cached connection and stops the reaper.
    ///
    /// Calls still pending complete with a connection error, and later
    /// requests are refused. The callback pool stops when the consumer and
    /// every future it handed out are dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reaper.abort();
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (addr, connection) in connections {
            if let Err(e) = connection.close().await {
                tracing::warn!(addr = %addr, "Error closing connection: {}", e);
            }
        }
        tracing::info!("Consumer closed");
    }

    /// Picks the provider address for a request.
    ///
    /// Every request currently goes to the configured provider.
    fn resolve_address(&self, _request: &RpcRequest) -> &str {
        &self.config.provider_addr
    }

    async fn connection(&self, addr: &str) -> Result<Arc<ConsumerConnection>> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(addr).filter(|c| c.is_active()) {
            return Ok(connection.clone());
        }

        let connection = Arc::new(
            ConsumerConnection::connect(
                addr,
                &self.transport,
                &self.config.serialization_type,
                self.callback_pool.clone(),
            )
            .await?,
        );
        if connections.insert(addr.to_string(), connection.clone()).is_some() {
            tracing::info!(addr = %addr, "Replaced inactive connection");
        }
        Ok(connection)
    }
}

impl Drop for RpcConsumer {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap_pending(connections: Arc<ConnectionCache>, config: ConsumerConfig) {
    let mut interval = tokio::time::interval(config.reaper_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let snapshot: Vec<_> = connections.lock().await.values().cloned().collect();
        for connection in snapshot {
            let evicted = connection.reap_expired(config.pending_ttl);
            if evicted > 0 {
                tracing::warn!(addr = %connection.addr(), evicted, "Reaped expired pending calls");
            }
        }
    }
}
