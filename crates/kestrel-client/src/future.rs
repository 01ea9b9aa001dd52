//! Call correlation handle.
//!
//! An [`RpcFuture`] is created for every tracked request (sync or async) and
//! lives in the connection's pending-call table until the matching response
//! arrives. It moves from pending to done exactly once; completion wakes every
//! waiter and hands registered callbacks to the consumer's callback pool.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kestrel_common::threadpool::WorkerPool;
use kestrel_common::{RequestId, RpcError, RpcProtocol, RpcRequest, RpcResponse, RpcStatus, RpcValue};
use kestrel_common::Result;
use tokio::sync::watch;

/// Completions slower than this are logged as a warning.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_millis(5000);

type Completed = Option<Arc<RpcProtocol<RpcResponse>>>;

/// Receives the outcome of an async call.
///
/// Callbacks run on the consumer's callback pool, never on the task reading
/// the connection, so they may block.
pub trait RpcCallback: Send + Sync + 'static {
    /// Called with the response's result when the provider reported success.
    fn on_success(&self, result: Option<RpcValue>);

    /// Called when the response carries an error or the call could not complete.
    fn on_exception(&self, error: RpcError);
}

/// Adapts a pair of closures into an [`RpcCallback`].
pub struct FnCallback<S, E> {
    on_success: S,
    on_exception: E,
}

impl<S, E> FnCallback<S, E>
where
    S: Fn(Option<RpcValue>) + Send + Sync + 'static,
    E: Fn(RpcError) + Send + Sync + 'static,
{
    pub fn new(on_success: S, on_exception: E) -> Self {
        Self {
            on_success,
            on_exception,
        }
    }
}

impl<S, E> RpcCallback for FnCallback<S, E>
where
    S: Fn(Option<RpcValue>) + Send + Sync + 'static,
    E: Fn(RpcError) + Send + Sync + 'static,
{
    fn on_success(&self, result: Option<RpcValue>) {
        (self.on_success)(result)
    }

    fn on_exception(&self, error: RpcError) {
        (self.on_exception)(error)
    }
}

/// Handle to the response of one in-flight request.
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct RpcFuture {
    inner: Arc<Inner>,
}

struct Inner {
    request: Arc<RpcProtocol<RpcRequest>>,
    started_at: Instant,
    state: watch::Sender<Completed>,
    callbacks: Mutex<Vec<Arc<dyn RpcCallback>>>,
    callback_pool: Arc<WorkerPool>,
}

impl RpcFuture {
    pub fn new(request: Arc<RpcProtocol<RpcRequest>>, callback_pool: Arc<WorkerPool>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                request,
                started_at: Instant::now(),
                state,
                callbacks: Mutex::new(Vec::new()),
                callback_pool,
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request.request_id()
    }

    /// The request this future answers.
    pub fn request(&self) -> &RpcProtocol<RpcRequest> {
        &self.inner.request
    }

    /// Time since the request was registered.
    pub fn elapsed(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// The response, if the future is done.
    pub fn response(&self) -> Option<Arc<RpcProtocol<RpcResponse>>> {
        self.inner.state.borrow().clone()
    }

    /// Stores the response and releases every waiter and callback.
    ///
    /// Returns `false` if the future was already done; the second response is
    /// discarded and the stored one is left untouched.
    pub fn complete(&self, response: RpcProtocol<RpcResponse>) -> bool {
        let response = Arc::new(response);

        // Holding the callback lock across the transition means a concurrent
        // add_callback either lands in the list or sees the future done.
        let mut guard = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let completed = self.inner.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(response.clone());
            true
        });
        if !completed {
            tracing::warn!(request_id = self.request_id(), "Future already completed, dropping response");
            return false;
        }
        let callbacks = std::mem::take(&mut *guard);
        drop(guard);

        for callback in callbacks {
            self.run_callback(callback, response.clone());
        }

        let elapsed = self.elapsed();
        if elapsed > SLOW_RESPONSE_THRESHOLD {
            tracing::warn!(
                request_id = self.request_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Service response time is too slow"
            );
        }
        true
    }

    /// Completes the future with a synthesized failed response.
    ///
    /// Used when no real response can arrive: the connection closed, the
    /// response body could not be decoded or the call was evicted.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let header = self.inner.request.header.clone().into_response(RpcStatus::Fail);
        let body = RpcResponse::error(reason).echo_flags(
            self.inner.request.body.async_call,
            self.inner.request.body.oneway,
        );
        self.complete(RpcProtocol::new(header, body))
    }

    /// Registers a callback.
    ///
    /// If the future is already done the callback is scheduled right away.
    pub fn add_callback(&self, callback: impl RpcCallback) {
        self.add_shared_callback(Arc::new(callback))
    }

    pub fn add_shared_callback(&self, callback: Arc<dyn RpcCallback>) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.response() {
            Some(response) => {
                drop(callbacks);
                self.run_callback(callback, response);
            }
            None => callbacks.push(callback),
        }
    }

    /// Waits for the response without a deadline.
    ///
    /// Pending calls are still bounded by the consumer's idle reaper and by
    /// the lifetime of their connection.
    pub async fn wait(&self) -> Arc<RpcProtocol<RpcResponse>> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(response) = current {
                return response;
            }
            // The sender lives in `inner`, which we hold, so this never errors
            let _ = rx.changed().await;
        }
    }

    /// Waits for the response for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] carrying the request id, class and method
    /// when no response arrived in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Arc<RpcProtocol<RpcResponse>>> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| self.timeout_error())
    }

    /// Waits for at most `timeout` and unwraps the response body.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] on timeout and [`RpcError::Remote`] when
    /// the provider answered with an error.
    pub async fn get(&self, timeout: Duration) -> Result<Option<RpcValue>> {
        let response = self.wait_timeout(timeout).await?;
        into_result(&response.body)
    }

    /// The timeout error describing this call.
    pub fn timeout_error(&self) -> RpcError {
        RpcError::Timeout {
            request_id: self.request_id(),
            class_name: self.inner.request.body.class_name.clone(),
            method_name: self.inner.request.body.method_name.clone(),
        }
    }

    /// Hands a callback to the callback pool.
    ///
    /// A callback the pool rejects is still told: its `on_exception` receives
    /// the rejection on a blocking thread, off the task that completed the
    /// future.
    fn run_callback(&self, callback: Arc<dyn RpcCallback>, response: Arc<RpcProtocol<RpcResponse>>) {
        let request_id = self.request_id();
        let job_callback = callback.clone();
        let submitted = self.inner.callback_pool.submit(move || match into_result(&response.body) {
            Ok(result) => job_callback.on_success(result),
            Err(error) => job_callback.on_exception(error),
        });
        if let Err(e) = submitted {
            tracing::warn!(request_id, "Callback pool rejected callback: {}", e);
            deliver_rejection(callback, e);
        }
    }
}

fn deliver_rejection(callback: Arc<dyn RpcCallback>, error: RpcError) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || callback.on_exception(error));
        }
        // Not on a runtime thread, so nothing is blocked by running it here
        Err(_) => callback.on_exception(error),
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFuture")
            .field("request_id", &self.request_id())
            .field("done", &self.is_done())
            .finish()
    }
}

fn into_result(body: &RpcResponse) -> Result<Option<RpcValue>> {
    match &body.error {
        Some(error) => Err(RpcError::Remote(error.clone())),
        None => Ok(body.result.clone()),
    }
}
