//! turing-cluster — the capability interface Turing deploys through.
//!
//! One `ClusterController` exists per deployment environment. It wraps the
//! Kubernetes, Knative and Istio APIs behind plain async calls; the
//! orchestrator never talks to the cluster any other way.
//!
//! # Components
//!
//! - **`resources`** — Plain descriptions of what to create (services, secrets, claims, routing rules)
//! - **`controller`** — The `ClusterController` trait
//! - **`memory`** — `InMemoryController`, a recording implementation with latency and fault injection

pub mod controller;
pub mod error;
pub mod memory;
pub mod resources;

pub use controller::ClusterController;
pub use error::{ClusterError, ClusterResult};
pub use memory::{ClusterOp, InMemoryController};
pub use resources::*;
