//! turing-deploy — turns a router version into running cluster resources.
//!
//! # Components
//!
//! - **`builder`** — `ResourceBuilder`, a pure mapping from a router version to resource specs
//! - **`events`** — the bounded, never-blocking progress event channel
//! - **`fanout`** — concurrent dispatch of independent cluster calls under one deadline
//! - **`orchestrator`** — `DeploymentService`: deploy, undeploy and endpoint removal

pub mod builder;
pub mod error;
pub mod events;
pub mod fanout;
pub mod orchestrator;

pub use builder::{ComponentSpec, DeploymentSecrets, DeploymentTarget, ResourceBuilder};
pub use error::{DeployError, DeployResult};
pub use events::{EventReader, EventWriter, ProgressEvent, event_channel};
pub use orchestrator::DeploymentService;
