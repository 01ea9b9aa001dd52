use std::time::Duration;

use kestrel_common::threadpool::PoolConfig;
use kestrel_common::transport::{
    validate_max_frame_len, validate_type_name, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_LEN,
};
use kestrel_common::transport::Serialization;
use kestrel_common::{Result, RpcError};

/// Default provider address until registry-based resolution exists.
pub const DEFAULT_PROVIDER_ADDR: &str = "127.0.0.1:27880";

/// Default time a sync call waits for its response.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default age after which an unanswered pending call is evicted.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60);

/// Default period of the pending-call sweep.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer configuration.
///
/// # Default Configuration
///
/// - `provider_addr`: `127.0.0.1:27880`
/// - `sync_timeout`: 5 seconds
/// - `serialization_type`: `json`
/// - `max_frame_len`: 16 MiB
/// - `callback_pool`: 16 workers, 65536 queued callbacks
/// - `pending_ttl`: 60 seconds, swept every second
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use kestrel_client::ConsumerConfig;
///
/// let config = ConsumerConfig::default()
///     .with_provider_addr("127.0.0.1:9000")
///     .with_sync_timeout(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// `host:port` of the provider every request is sent to
    pub provider_addr: String,
    /// How long a sync call waits before failing with a timeout
    pub sync_timeout: Duration,
    /// Serializer named in outgoing headers
    pub serialization_type: String,
    /// Largest frame body accepted from the provider
    pub max_frame_len: usize,
    pub connect_timeout: Duration,
    /// Pool that runs completion callbacks
    pub callback_pool: PoolConfig,
    /// Pending calls older than this are failed by the reaper
    pub pending_ttl: Duration,
    pub reaper_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            provider_addr: DEFAULT_PROVIDER_ADDR.to_string(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            serialization_type: Serialization::DEFAULT_TYPE.to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            callback_pool: PoolConfig::default(),
            pending_ttl: DEFAULT_PENDING_TTL,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

impl ConsumerConfig {
    pub fn with_provider_addr(mut self, addr: impl Into<String>) -> Self {
        self.provider_addr = addr.into();
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_serialization_type(mut self, name: impl Into<String>) -> Self {
        self.serialization_type = name.into();
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_callback_pool(mut self, pool: PoolConfig) -> Self {
        self.callback_pool = pool;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Checks the configuration before any resource is created.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.provider_addr.is_empty() {
            return Err(RpcError::InvalidConfig("provider address must not be empty".to_string()));
        }
        validate_type_name(&self.serialization_type)?;
        Serialization::from_type(&self.serialization_type)
            .map_err(|e| RpcError::InvalidConfig(e.to_string()))?;
        if self.sync_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("sync timeout must be greater than zero".to_string()));
        }
        validate_max_frame_len(self.max_frame_len)?;
        if self.pending_ttl.is_zero() || self.reaper_interval.is_zero() {
            return Err(RpcError::InvalidConfig(
                "pending ttl and reaper interval must be greater than zero".to_string(),
            ));
        }
        self.callback_pool.validate().map_err(RpcError::InvalidConfig)
    }
}
