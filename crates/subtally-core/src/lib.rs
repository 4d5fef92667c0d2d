//! subtally-core library.
//!
//! Daily subscription-transaction feeds go through the row normalizer into a
//! month-partitioned columnar store, deduplicated by natural key. Gaps between
//! the store and the raw archive are detected and backfilled. Daily per-code
//! counters are derived from the store and rolled up per commercial service.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per module; `anyhow::Result` in the
//!   run drivers, classified into an [`error::ErrorCode`] per failed unit.
//! - **Logging**: `tracing` macros, one event per file, partition or date,
//!   never per row.

pub mod atomic;
pub mod backfill;
pub mod columnar;
pub mod config;
pub mod counters;
pub mod error;
pub mod exclusions;
pub mod gap;
pub mod mapping;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod service;
pub mod source;
pub mod store;
