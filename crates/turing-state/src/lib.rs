//! turing-state — embedded state store for Turing.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for routers, router versions and their enricher/ensembler
//! children, the deployment event log, and ensembling jobs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by numeric ids drawn from a per-table sequence. A router version's
//! enricher and ensembler live in their own tables and are written and
//! removed in the same transaction as the version row.
//!
//! Invariants enforced at this layer, inside a single write transaction:
//! - router names are unique per project and environment
//! - version numbers per router start at 1 and are never reused
//! - a version referenced as some router's current version cannot be deleted
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod jobs;
pub mod routers;
pub mod store;
pub mod tables;
pub mod types;
pub mod versions;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
