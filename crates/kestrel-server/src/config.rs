use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use kestrel_common::threadpool::PoolConfig;
use kestrel_common::transport::{validate_max_frame_len, DEFAULT_MAX_FRAME_LEN};
use kestrel_common::{Result, RpcError};

/// Default address the provider listens on.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:27880";

/// Which [`Invoker`](crate::invoker::Invoker) strategy the provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvokerKind {
    /// Look the method up by name and parameter types on every call
    #[default]
    Dynamic,
    /// Resolve each method once and reuse the resolution
    Cached,
}

impl FromStr for InvokerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dynamic" => Ok(InvokerKind::Dynamic),
            "cached" => Ok(InvokerKind::Cached),
            other => Err(format!("unknown invoker '{}', expected 'dynamic' or 'cached'", other)),
        }
    }
}

impl fmt::Display for InvokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokerKind::Dynamic => f.write_str("dynamic"),
            InvokerKind::Cached => f.write_str("cached"),
        }
    }
}

/// Provider configuration.
///
/// # Fields
///
/// - `bind_addr` - Listen address (default: `127.0.0.1:27880`)
/// - `invoker` - Invocation strategy (default: dynamic)
/// - `pool` - Worker pool running service methods (default: 16 workers, 65536 queued requests)
/// - `max_frame_len` - Largest request body accepted (default: 16 MiB)
///
/// # Example
///
/// ```
/// use kestrel_server::{InvokerKind, ProviderConfig};
///
/// let config = ProviderConfig::default()
///     .with_bind_addr("127.0.0.1:0")
///     .with_invoker(InvokerKind::Cached);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub bind_addr: String,
    pub invoker: InvokerKind,
    pub pool: PoolConfig,
    pub max_frame_len: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            invoker: InvokerKind::default(),
            pool: PoolConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_invoker(mut self, invoker: InvokerKind) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Parses the bind address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.bind_addr.parse()?)
    }

    /// Validates the provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The bind address is not a `host:port` socket address
    /// - The worker pool has no workers or no queue
    /// - The max frame length is zero or does not fit the header's 32-bit
    ///   body length
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        self.pool.validate().map_err(RpcError::InvalidConfig)?;
        validate_max_frame_len(self.max_frame_len)
    }
}
