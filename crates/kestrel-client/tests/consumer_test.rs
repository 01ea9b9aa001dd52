//! Consumer Integration Tests
//!
//! These tests run an `RpcConsumer` against a scripted provider on an
//! ephemeral port and verify:
//! - Sync, async and oneway call modes
//! - Sync timeouts and that they leave nothing pending
//! - Connection reuse and replacement of a dead connection
//! - Refusal of calls after close

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use kestrel_client::{CallOutcome, ConsumerConfig, FnCallback, RpcConsumer};
use kestrel_common::transport::RpcCodec;
use kestrel_common::{RpcError, RpcFrame, RpcProtocol, RpcRequest, RpcResponse, RpcStatus};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Scripted provider.
///
/// - `sayHello(name)` answers `"Hello " + name`
/// - `fail` answers with an error
/// - `hang` never answers
/// - `hangup` closes the connection
struct ScriptedProvider {
    addr: String,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        let accepted = connections.clone();
        let received = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let received = received.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, RpcCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        let RpcFrame::Request(request) = frame else {
                            continue;
                        };
                        received.fetch_add(1, Ordering::SeqCst);
                        let Some(response) = answer(&request) else {
                            if request.body.method_name == "hangup" {
                                return;
                            }
                            continue;
                        };
                        if framed.send(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            requests,
        }
    }

    fn config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
            .with_provider_addr(self.addr.clone())
            .with_sync_timeout(Duration::from_millis(300))
    }
}

fn answer(request: &RpcProtocol<RpcRequest>) -> Option<RpcProtocol<RpcResponse>> {
    let body = &request.body;
    let (status, response) = match body.method_name.as_str() {
        "sayHello" => {
            let name = body.parameters.first()?.as_str()?.to_string();
            (RpcStatus::Success, RpcResponse::success(json!(format!("Hello {}", name))))
        }
        "fail" => (RpcStatus::Fail, RpcResponse::error("something broke")),
        _ => return None,
    };
    let header = request.header.clone().into_response(status);
    Some(RpcProtocol::new(
        header,
        response.echo_flags(body.async_call, body.oneway),
    ))
}

fn say_hello(name: &str) -> RpcRequest {
    RpcRequest::new("DemoService", "sayHello")
        .with_parameter("String", json!(name))
        .with_version("1.0.0")
        .with_group("test")
}

#[tokio::test]
async fn test_sync_call() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    let result = consumer.call_sync(say_hello("lizhe")).await.unwrap();
    assert_eq!(result, Some(json!("Hello lizhe")));
    assert_eq!(consumer.pending_count().await, 0);
}

#[tokio::test]
async fn test_send_request_dispatches_on_flags() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    let outcome = consumer.send_request(say_hello("sync")).await.unwrap();
    assert!(matches!(outcome, CallOutcome::Completed(Some(ref v)) if v == "Hello sync"));

    let outcome = consumer.send_request(say_hello("async").with_async(true)).await.unwrap();
    let CallOutcome::Async(future) = outcome else {
        panic!("expected an async handle");
    };
    let response = tokio::time::timeout(Duration::from_secs(5), future.wait()).await.unwrap();
    assert_eq!(response.body.result, Some(json!("Hello async")));
    assert!(response.body.async_call);

    let outcome = consumer.send_request(say_hello("oneway").with_oneway(true)).await.unwrap();
    assert!(matches!(outcome, CallOutcome::Oneway));
}

#[tokio::test]
async fn test_remote_error_is_a_failure() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    let err = consumer
        .call_sync(RpcRequest::new("DemoService", "fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref m) if m == "something broke"));
}

#[tokio::test]
async fn test_sync_timeout_cleans_up() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    let started = Instant::now();
    let err = consumer
        .call_sync(RpcRequest::new("DemoService", "hang"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout { ref method_name, .. } if method_name == "hang"));
    assert!(elapsed >= Duration::from_millis(300), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(consumer.pending_count().await, 0);
}

#[tokio::test]
async fn test_oneway_returns_without_pending_entry() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    // `hang` never answers, yet a oneway call returns right away
    let started = Instant::now();
    consumer
        .call_oneway(RpcRequest::new("DemoService", "hang"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(consumer.pending_count().await, 0);

    // The provider still gets the call
    tokio::time::timeout(Duration::from_secs(5), async {
        while provider.requests.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_async_callback() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));

    let future = consumer.call_async(say_hello("callback")).await.unwrap();
    future.add_callback(FnCallback::new(
        move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        },
        |err| panic!("unexpected failure: {}", err),
    ));

    let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(result, Some(json!("Hello callback")));
}

#[tokio::test]
async fn test_connection_is_reused() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    for i in 0..5 {
        let name = format!("caller-{}", i);
        let result = consumer.call_sync(say_hello(&name)).await.unwrap();
        assert_eq!(result, Some(json!(format!("Hello {}", name))));
    }
    assert_eq!(provider.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dead_connection_is_replaced() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();

    // The provider hangs up: the pending async call fails instead of waiting forever
    let future = consumer
        .call_async(RpcRequest::new("DemoService", "hangup"))
        .await
        .unwrap();
    let err = future.get(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref m) if m.contains("closed")));

    // Wait for the reader to notice, then the next call reconnects
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = consumer.call_sync(say_hello("again")).await.unwrap();
    assert_eq!(result, Some(json!("Hello again")));
    assert_eq!(provider.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reaper_evicts_abandoned_async_calls() {
    let provider = ScriptedProvider::start().await;
    let config = provider
        .config()
        .with_pending_ttl(Duration::from_millis(100))
        .with_reaper_interval(Duration::from_millis(20));
    let consumer = RpcConsumer::new(config).unwrap();

    let future = consumer
        .call_async(RpcRequest::new("DemoService", "hang"))
        .await
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), future.wait())
        .await
        .unwrap();
    assert_eq!(response.header.status, RpcStatus::Fail);
    assert!(response.body.error.as_deref().unwrap().contains("Timeout exception"));
    assert_eq!(consumer.pending_count().await, 0);
}

#[tokio::test]
async fn test_closed_consumer_refuses_calls() {
    let provider = ScriptedProvider::start().await;
    let consumer = RpcConsumer::new(provider.config()).unwrap();
    consumer.call_sync(say_hello("before")).await.unwrap();

    consumer.close().await;
    let err = consumer.call_sync(say_hello("after")).await.unwrap_err();
    assert!(matches!(err, RpcError::Connection(_)));
}

#[tokio::test]
async fn test_unreachable_provider() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let consumer = RpcConsumer::new(ConsumerConfig::default().with_provider_addr(addr)).unwrap();
    let err = consumer.call_sync(say_hello("nobody")).await.unwrap_err();
    assert!(matches!(err, RpcError::Connection(_)));
}
