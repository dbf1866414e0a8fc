//! turing-core — configuration and naming shared by the Turing control plane.
//!
//! - **`config`** — `TuringConfig`, parsed from a TOML document
//! - **`naming`** — the naming scheme for every cluster resource a router owns

pub mod config;
pub mod naming;

pub use config::{ConfigError, TuringConfig};
pub use naming::ComponentKind;
