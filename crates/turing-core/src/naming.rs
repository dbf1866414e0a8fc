//! Cluster resource naming.
//!
//! Every resource a router version owns is named from the router name, the
//! component and the version number. Deploy and undeploy derive names the
//! same way, so resources left behind by a failed teardown can be listed
//! from the router record alone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A deployable part of a router version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Enricher,
    Router,
    Ensembler,
    FluentdLogger,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Enricher => "enricher",
            ComponentKind::Router => "router",
            ComponentKind::Ensembler => "ensembler",
            ComponentKind::FluentdLogger => "fluentd-logger",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{router}-turing-{component}-{version}`
pub fn service_name(router: &str, kind: ComponentKind, version: u32) -> String {
    format!("{router}-turing-{kind}-{version}")
}

/// `{router}-turing-secret-{version}`
pub fn secret_name(router: &str, version: u32) -> String {
    format!("{router}-turing-secret-{version}")
}

/// Claim backing one version's fluentd logger buffer.
pub fn pvc_name(router: &str, version: u32) -> String {
    format!("{router}-turing-fluentd-logger-pvc-{version}")
}

/// `{router}-turing-fiber-config-{version}`, the router's route table.
pub fn config_map_name(router: &str, version: u32) -> String {
    format!("{router}-turing-fiber-config-{version}")
}

/// The stable routing rule; one per router, repointed on every deploy.
pub fn virtual_service_name(router: &str) -> String {
    format!("{router}-turing-router")
}

/// Workloads are deployed into a namespace named after the project.
pub fn namespace(project: &str) -> String {
    project.to_string()
}

/// Host clients use to reach the router, regardless of version.
pub fn router_host(router: &str, namespace: &str, domain: &str) -> String {
    format!("{router}-turing-router.{namespace}.{domain}")
}
