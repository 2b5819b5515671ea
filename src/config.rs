//! Configuration types for services, providers and clients.

use crate::store::DEFAULT_POOL_MODE;
use crate::testing::failpoint::FailpointRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default eager limit in bytes.
pub const DEFAULT_EAGER_LIMIT: u64 = 2048;

/// Maximum size of a single framed message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default chunk size for bulk pulls/pushes and target streaming.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// How long an incoming target transfer may go without a chunk.
pub const DEFAULT_TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for one migration request issued by a client.
pub const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Configuration for a service hosting one or more providers.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to bind the RPC listener to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Maximum accepted frame size in bytes.
    pub max_message_size: usize,

    /// Whether clients may stop the service remotely.
    pub remote_shutdown: bool,

    /// Outbound client settings used for migrations.
    pub client: ClientConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            remote_shutdown: false,
            client: ClientConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration bound to the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            client: ClientConfig::default().with_bulk_bind_addr(SocketAddr::new(bind_addr.ip(), 0)),
            ..Default::default()
        }
    }

    /// Allow remote shutdown requests.
    pub fn with_remote_shutdown(mut self, enabled: bool) -> Self {
        self.remote_shutdown = enabled;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the outbound client configuration.
    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }
}

/// Configuration for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Track per-region persisted size. When off, `get_size` is unsupported
    /// and reads are bounded only by capacity.
    pub size_tracking: bool,

    /// Chunk size used when streaming a target to another provider.
    pub target_chunk_size: usize,

    /// Chunk size used when pulling from or pushing to bulk buffers.
    pub bulk_chunk_size: usize,

    /// Permission bits for pool files created by this provider.
    pub pool_mode: u32,

    /// Incoming target transfers idle for longer than this are discarded.
    pub transfer_idle_timeout: Duration,

    /// Failpoints injected into the region stores of this provider.
    pub failpoints: Option<Arc<FailpointRegistry>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            size_tracking: true,
            target_chunk_size: DEFAULT_CHUNK_SIZE,
            bulk_chunk_size: DEFAULT_CHUNK_SIZE,
            pool_mode: DEFAULT_POOL_MODE,
            transfer_idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
            failpoints: None,
        }
    }
}

impl ProviderConfig {
    /// Create a default provider configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable size tracking.
    pub fn with_size_tracking(mut self, enabled: bool) -> Self {
        self.size_tracking = enabled;
        self
    }

    /// Set the target streaming chunk size.
    pub fn with_target_chunk_size(mut self, size: usize) -> Self {
        self.target_chunk_size = size.max(1);
        self
    }

    /// Set the bulk transfer chunk size.
    pub fn with_bulk_chunk_size(mut self, size: usize) -> Self {
        self.bulk_chunk_size = size.max(1);
        self
    }

    /// Set the permission bits for new pool files.
    pub fn with_pool_mode(mut self, mode: u32) -> Self {
        self.pool_mode = mode;
        self
    }

    /// Set how long an incoming target transfer may stall.
    pub fn with_transfer_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_idle_timeout = timeout;
        self
    }

    /// Inject failpoints into every region store.
    pub fn with_failpoints(mut self, registry: Arc<FailpointRegistry>) -> Self {
        self.failpoints = Some(registry);
        self
    }
}

/// Configuration for a client and the provider handles it creates.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Initial eager limit of new provider handles.
    pub eager_limit: u64,

    /// Timeout for one request/response exchange.
    pub rpc_timeout: Duration,

    /// Timeout for `migrate_region` and `migrate_target` requests, which span
    /// a whole copy. If it expires the client sees `Timeout` but the provider
    /// carries on and may still complete the migration.
    pub migration_timeout: Duration,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Address of the listener serving this client's exposed bulk buffers.
    pub bulk_bind_addr: SocketAddr,

    /// Chunk size used when serving bulk buffers.
    pub bulk_chunk_size: usize,

    /// Idle connections kept per provider handle.
    pub max_idle_connections: usize,

    /// Maximum accepted frame size in bytes.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            eager_limit: DEFAULT_EAGER_LIMIT,
            rpc_timeout: Duration::from_secs(30),
            migration_timeout: DEFAULT_MIGRATION_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            bulk_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bulk_chunk_size: DEFAULT_CHUNK_SIZE,
            max_idle_connections: 8,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a default client configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial eager limit.
    pub fn with_eager_limit(mut self, limit: u64) -> Self {
        self.eager_limit = limit;
        self
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the migration request timeout.
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the bulk listener address.
    pub fn with_bulk_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bulk_bind_addr = addr;
        self
    }

    /// Set the bulk chunk size.
    pub fn with_bulk_chunk_size(mut self, size: usize) -> Self {
        self.bulk_chunk_size = size.max(1);
        self
    }

    /// Set the number of idle connections kept per provider handle.
    pub fn with_max_idle_connections(mut self, count: usize) -> Self {
        self.max_idle_connections = count;
        self
    }
}
