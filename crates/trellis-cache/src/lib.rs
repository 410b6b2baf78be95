//! Content-addressed execution cache for trellis, backed by SQLite.
//!
//! Stores one row per artifact keyed by input hash, the executed
//! provenance edges, and per-run counters. Invalidation walks the
//! provenance table so a changed artifact marks exactly its transitive
//! dependents pending.

pub mod store;

pub use store::{CacheEntry, CacheStats, ExecutionCache, ExecutionStatus, RunRecord};
