//! redb table definitions for the Turing state store.
//!
//! Record tables use `u64` id keys and `&[u8]` values (JSON-serialized
//! domain types). Index tables map a composite `&str` key to an id.

use redb::TableDefinition;

/// Routers keyed by id.
pub const ROUTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("routers");

/// Router ids keyed by `{project_id}/{environment}/{name}`.
pub const ROUTER_NAMES: TableDefinition<&str, u64> = TableDefinition::new("router_names");

/// Router versions keyed by id. Children are stored by reference.
pub const ROUTER_VERSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("router_versions");

pub const ENRICHERS: TableDefinition<u64, &[u8]> = TableDefinition::new("enrichers");

pub const ENSEMBLERS: TableDefinition<u64, &[u8]> = TableDefinition::new("ensemblers");

/// Deployment events keyed by id (insertion order).
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

pub const ENSEMBLING_JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("ensembling_jobs");

/// Last value handed out per sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
