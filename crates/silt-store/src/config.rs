//! Configuration for the cache and the write-behind engine.

use std::time::Duration;

/// Default number of workers kept alive regardless of load.
pub const DEFAULT_CORE_POOL_SIZE: usize = 3;

/// Default upper bound on the worker pool.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Default idle time after which a worker above the target count exits.
pub const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the persistence queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// Default queue-occupancy thresholds, as percentages of queue capacity.
/// One entry per pool-size step; the last step is treated as unbounded.
pub const DEFAULT_QUEUE_THRESHOLDS_PCT: [u32; 10] = [10, 20, 30, 30, 50, 50, 60, 70, 80, 100];

/// Default bounded wait when taking a record's lock on the enqueue path.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Default idle time after which the sweeper evicts a cached record.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default interval between sweeper passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default skew window for header activity timestamps.
pub const DEFAULT_HEADER_TIME_SKEW: Duration = Duration::from_secs(60);

/// Configuration for the write-behind engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workers kept alive regardless of load.
    pub core_pool_size: usize,

    /// Upper bound on the worker pool.
    pub max_pool_size: usize,

    /// Idle time after which a worker above the target count exits.
    pub worker_idle_timeout: Duration,

    /// Bound on the persistence queue; submissions beyond it are rejected.
    pub queue_capacity: usize,

    /// Queue-occupancy thresholds as percentages of capacity, one per
    /// pool-size step. Length must equal `max_pool_size`.
    pub queue_thresholds_pct: Vec<u32>,

    /// Bounded wait when taking a record's lock on the enqueue path.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            core_pool_size: DEFAULT_CORE_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            worker_idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_thresholds_pct: DEFAULT_QUEUE_THRESHOLDS_PCT.to_vec(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the core pool size.
    pub fn with_core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    /// Set the maximum pool size.
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the worker idle timeout.
    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the occupancy thresholds (percentages of capacity).
    pub fn with_queue_thresholds_pct(mut self, thresholds: Vec<u32>) -> Self {
        self.queue_thresholds_pct = thresholds;
        self
    }

    /// Set the enqueue-path lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Configuration for the record cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Idle time after which the sweeper evicts a cached record.
    pub idle_timeout: Duration,

    /// Interval between sweeper passes.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle-eviction timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the sweeper interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Top-level configuration for a [`SessionStore`](crate::SessionStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Write-behind engine settings.
    pub engine: EngineConfig,

    /// Record cache settings.
    pub cache: CacheConfig,

    /// Skew window for header activity timestamps.
    pub header_time_skew: Duration,

    /// Identifier of this node, stamped into header snapshots.
    pub node_id: String,

    /// Application identifier, stamped into header snapshots.
    pub app: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cache: CacheConfig::default(),
            header_time_skew: DEFAULT_HEADER_TIME_SKEW,
            node_id: "localhost".to_string(),
            app: "/".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the header timestamp skew window.
    pub fn with_header_time_skew(mut self, skew: Duration) -> Self {
        self.header_time_skew = skew;
        self
    }

    /// Set the node identifier.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the application identifier.
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }
}
