pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::{BalanceState, BalanceUpdate, CachedBalance};
pub use infrastructure::{
    AppConfig, BalanceCache, BalanceRepository, ConnectionManager, IngestMetrics,
    PgBalanceRepository,
};
