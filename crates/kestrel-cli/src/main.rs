//! # Kestrel CLI Entry Point
//!
//! Main binary for kestrel. Starts a provider serving the demo service, or
//! makes a single call against a provider.
//!
//! ## Usage
//!
//! ```bash
//! # Serve DemoService#1.0.0#test
//! kestrel provider --bind 127.0.0.1:27880 --invoker cached
//!
//! # Make a sync call (outputs raw JSON)
//! kestrel call 127.0.0.1:27880 --class DemoService --method sayHello \
//!     --param-type String --args '["lizhe"]' --version 1.0.0 --group test
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use kestrel_client::{CallOutcome, ConsumerConfig, RpcConsumer};
use kestrel_common::RpcRequest;
use kestrel_server::{demo, InvokerKind, ProviderConfig, RpcServer, DEFAULT_BIND_ADDR};

#[derive(FromArgs)]
/// kestrel - a small RPC framework
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Provider(ProviderArgs),
    Call(CallArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "provider")]
/// serve the demo service
struct ProviderArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "DEFAULT_BIND_ADDR.to_string()")]
    bind: String,

    /// invocation strategy: dynamic or cached
    #[argh(option, short = 'i', default = "InvokerKind::Dynamic")]
    invoker: InvokerKind,

    /// number of workers running service methods
    #[argh(option, default = "16")]
    workers: usize,

    /// requests that may wait for a worker before being rejected
    #[argh(option, default = "65536")]
    queue_capacity: usize,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make a single RPC call and print the result as JSON
struct CallArgs {
    /// provider address (host:port)
    #[argh(positional)]
    provider: String,

    /// target service name
    #[argh(option, short = 'c')]
    class: String,

    /// method to call
    #[argh(option, short = 'm')]
    method: String,

    /// arguments as a JSON array, e.g. '["lizhe"]'
    #[argh(option, short = 'a', default = "\"[]\".into()")]
    args: String,

    /// declared parameter type, once per argument
    #[argh(option, short = 't', long = "param-type")]
    param_types: Vec<String>,

    /// service version
    #[argh(option, default = "String::new()")]
    version: String,

    /// service group
    #[argh(option, default = "String::new()")]
    group: String,

    /// send as an async call and wait on the returned future
    #[argh(switch, long = "async")]
    async_call: bool,

    /// send as a oneway call and return as soon as it is written
    #[argh(switch)]
    oneway: bool,

    /// how long to wait for the response, in milliseconds
    #[argh(option, default = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for `call` so the output can be piped
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Provider(args) => run_provider(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_provider(args: ProviderArgs) -> Result<()> {
    let config = ProviderConfig::default()
        .with_bind_addr(args.bind)
        .with_invoker(args.invoker)
        .with_pool(kestrel_common::threadpool::PoolConfig::new(args.workers, args.queue_capacity));

    let server = RpcServer::bind(config, demo::registry()).await?;
    tracing::info!(
        "Serving {}#{}#{} on {}",
        demo::CLASS_NAME,
        demo::VERSION,
        demo::GROUP,
        server.local_addr()
    );

    let handle = server.spawn();
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown().await?;
    Ok(())
}

fn build_request(args: &CallArgs) -> Result<RpcRequest> {
    let parameters: Vec<serde_json::Value> =
        serde_json::from_str(&args.args).context("--args must be a JSON array")?;

    let param_types = if args.param_types.is_empty() {
        parameters.iter().map(json_type_name).collect()
    } else {
        args.param_types.clone()
    };
    if param_types.len() != parameters.len() {
        anyhow::bail!(
            "{} parameter types given for {} arguments",
            param_types.len(),
            parameters.len()
        );
    }

    let request = param_types
        .into_iter()
        .zip(parameters)
        .fold(RpcRequest::new(&args.class, &args.method), |request, (type_name, value)| {
            request.with_parameter(type_name, value)
        });
    Ok(request
        .with_version(&args.version)
        .with_group(&args.group)
        .with_async(args.async_call)
        .with_oneway(args.oneway))
}

/// Default declared type for an argument when `--param-type` is not given.
fn json_type_name(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(_) => "String",
        serde_json::Value::Number(n) if n.is_f64() => "double",
        serde_json::Value::Number(_) => "int",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Array(_) => "List",
        serde_json::Value::Object(_) => "Map",
        serde_json::Value::Null => "Object",
    }
    .to_string()
}

async fn run_call(args: CallArgs) -> Result<()> {
    let request = build_request(&args)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let config = ConsumerConfig::default()
        .with_provider_addr(args.provider.clone())
        .with_sync_timeout(timeout);
    let consumer = RpcConsumer::new(config)?;

    let result = match consumer.send_request(request).await? {
        CallOutcome::Completed(result) => Some(result),
        CallOutcome::Async(future) => Some(future.get(timeout).await?),
        CallOutcome::Oneway => None,
    };
    consumer.close().await;

    if let Some(result) = result {
        // Output raw JSON to stdout
        println!("{}", serde_json::to_string(&result.unwrap_or(serde_json::Value::Null))?);
    }
    Ok(())
}
