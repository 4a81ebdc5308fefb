//! Pool supervision: health tracking, proxy selection, the manager task, and
//! the periodic monitor.

pub mod health;
pub mod manager;
pub mod monitor;
pub mod selection;

pub use health::{HealthRecord, HealthTracker};
pub use manager::{PoolCommand, PoolHandle, PoolManager, PoolStatus};
pub use monitor::PoolMonitor;
pub use selection::{ProxySelector, RandomSelector};
