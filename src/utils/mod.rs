//! # Utility Modules
//!
//! Supporting pieces shared by the engine.
//!
//! ## Components
//! - **Buffer Pool**: fixed-size read buffers reused across connections
//! - **Logging**: tracing subscriber setup from config
//! - **Metrics**: network statistics counters and operation timer

pub mod buffer_pool;
pub mod logging;
pub mod metrics;

pub use buffer_pool::BufferPool;
pub use metrics::{NetworkStatistics, StatisticsSnapshot};
