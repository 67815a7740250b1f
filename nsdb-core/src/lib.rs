//! NSDb Core - Time-Series Storage and Query Engine
//!
//! A single-node time-series database with a SQL-like statement surface:
//!
//! - **Statement parser**: SELECT/INSERT/DELETE/DROP in the NSDb dialect,
//!   including relative time literals and temporal grouping
//! - **Schema registry**: per-metric schemas inferred from records and
//!   widened monotonically
//! - **Index engine**: per-shard inverted index over dimensions and tags
//!   with stored records, bitmap boolean queries and aggregating collectors
//! - **Shard router**: metric storage partitioned into aligned time-range
//!   locations, allocated lazily on write
//! - **Write accumulator**: per-namespace batched writes and deletes,
//!   flushed on a fixed-period tick
//! - **Planner and coordinator**: statements lowered against the schema
//!   into physical per-shard queries whose results merge globally

pub mod accumulator;
pub mod config;
pub mod engine;
pub mod index;
pub mod planner;
pub mod schema;
pub mod sharding;
pub mod statement;
pub mod storage;

mod error;
mod types;

pub use config::NsdbConfig;
pub use engine::{Engine, StatementResult};
pub use error::{NsdbError, Result};
pub use types::*;

/// NSDb version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
