//! turing-lifecycle — router, router version and ensembling job lifecycles.
//!
//! - **`routers`** — `RouterService`: create, update, deploy (and roll back
//!   to) a version, undeploy and delete routers
//! - **`versions`** — `RouterVersionService`: version records and numbering
//! - **`locks`** — `RouterLocks`, one async mutex per router
//! - **`ensembling`** — `EnsemblingJobService` and the poll-and-claim
//!   `JobController`
//!
//! The router's current-version pointer only moves after a deployment
//! succeeds. A failed deployment marks the version `failed`, records its
//! progress events and leaves the router serving what it served before.

pub mod ensembling;
pub mod error;
pub mod locks;
mod recorder;
pub mod routers;
pub mod versions;

pub use ensembling::{EnsemblingJobService, JobController, JobRunner, RunState, TickSummary};
pub use error::{LifecycleError, LifecycleResult, RunnerError, RunnerResult};
pub use locks::RouterLocks;
pub use routers::{DeployOptions, RouterService};
pub use versions::RouterVersionService;
