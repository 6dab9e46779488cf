pub mod broker;
pub mod cache_service;
pub mod cache_sync;
pub mod config;
pub mod connection;
pub mod database;
pub mod logging;
pub mod metrics;
pub mod repository;
pub mod shutdown;
pub mod worker_pool;
pub mod write_batching;

pub use broker::{AmqpTransport, BrokerConfig, BrokerError, BrokerTransport, Delivery};
pub use cache_service::BalanceCache;
pub use cache_sync::{CacheSynchronizer, SyncConfig};
pub use config::AppConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use metrics::IngestMetrics;
pub use repository::{BalanceRepository, PgBalanceRepository, StoreError};
pub use write_batching::{BatchAccumulator, BatchFlusher, BatchingConfig};
