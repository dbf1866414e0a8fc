//! Domain types for the Turing state store.
//!
//! Routers, their immutable versions (with enricher and ensembler children),
//! the deployment event log, and batch ensembling jobs. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

pub type ProjectId = u64;
pub type RouterId = u64;
pub type RouterVersionId = u64;
pub type EnricherId = u64;
pub type EnsemblerId = u64;
pub type EventId = u64;
pub type JobId = u64;

/// The project that owns a router. Resolved by the caller; not persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub team: String,
    pub stream: String,
}

// ── Router ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterStatus {
    Pending,
    Deployed,
    Failed,
    Undeployed,
}

/// A router, unique per project and environment by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Router {
    pub id: RouterId,
    pub project_id: ProjectId,
    pub environment_name: String,
    pub name: String,
    pub status: RouterStatus,
    /// Stable endpoint clients call; set once a version has gone live.
    pub endpoint: Option<String>,
    /// The version traffic is routed to. Only moved after a successful deploy.
    pub curr_router_version_id: Option<RouterVersionId>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Router {
    pub fn new(project_id: ProjectId, environment_name: &str, name: &str) -> Self {
        Self {
            id: 0,
            project_id,
            environment_name: environment_name.to_string(),
            name: name.to_string(),
            status: RouterStatus::Pending,
            endpoint: None,
            curr_router_version_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Build the composite key for the router name index.
    pub fn name_key(&self) -> String {
        name_key(self.project_id, &self.environment_name, &self.name)
    }
}

pub(crate) fn name_key(project_id: ProjectId, environment: &str, name: &str) -> String {
    format!("{project_id}/{environment}/{name}")
}

// ── Router version ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterVersionStatus {
    Pending,
    Deployed,
    Failed,
    Undeployed,
}

/// One immutable configuration of a router.
///
/// Only `status`, `error` and `updated_at` change after creation; any other
/// change is a new version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterVersion {
    pub id: RouterVersionId,
    pub router_id: RouterId,
    /// 1-based, assigned by the store at creation.
    pub version: u32,
    pub status: RouterVersionStatus,
    pub error: String,
    pub image: String,
    pub routes: Vec<Route>,
    pub default_route_id: Option<String>,
    pub rules: Vec<TrafficRule>,
    pub experiment_engine: ExperimentConfig,
    pub resource_request: ResourceRequest,
    pub autoscaling_policy: AutoscalingPolicy,
    /// Request timeout, e.g. "100ms".
    pub timeout: String,
    pub protocol: Protocol,
    pub log_config: LogConfig,
    pub enricher: Option<Enricher>,
    pub ensembler: Option<Ensembler>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RouterVersion {
    /// True if the ensembler runs as its own service.
    pub fn has_docker_ensembler(&self) -> bool {
        matches!(
            self.ensembler.as_ref().map(|e| &e.kind),
            Some(EnsemblerKind::Docker(_))
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub endpoint: String,
    pub timeout: String,
    /// gRPC method, for UPI routers.
    pub service_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRule {
    pub name: String,
    pub conditions: Vec<TrafficRuleCondition>,
    /// Route ids the rule activates.
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRuleCondition {
    pub field_source: FieldSource,
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Header,
    Payload,
}

/// Experiment engine selection. The engine config is opaque to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    pub engine_type: String,
    pub config: serde_json::Value,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            engine_type: "nop".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequest {
    pub min_replica: u32,
    pub max_replica: u32,
    /// Kubernetes quantity, e.g. "500m".
    pub cpu_request: String,
    /// Kubernetes quantity, e.g. "512Mi".
    pub memory_request: String,
    pub cpu_limit: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            min_replica: 1,
            max_replica: 2,
            cpu_request: "500m".to_string(),
            memory_request: "512Mi".to_string(),
            cpu_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoscalingMetric {
    Concurrency,
    Rps,
    Cpu,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoscalingPolicy {
    pub metric: AutoscalingMetric,
    pub target: String,
}

impl Default for AutoscalingPolicy {
    fn default() -> Self {
        Self {
            metric: AutoscalingMetric::Concurrency,
            target: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Upi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub custom_metrics_enabled: bool,
    pub fiber_debug_log_enabled: bool,
    pub jaeger_enabled: bool,
    pub result_logger: ResultLogger,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            custom_metrics_enabled: false,
            fiber_debug_log_enabled: false,
            jaeger_enabled: false,
            result_logger: ResultLogger::Nop,
        }
    }
}

impl LogConfig {
    /// True if results go through the fluentd sidecar.
    pub fn uses_batched_logger(&self) -> bool {
        matches!(
            self.result_logger,
            ResultLogger::BigQuery {
                batch_load: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultLogger {
    Nop,
    Console,
    BigQuery {
        table: String,
        service_account_secret: String,
        /// Route rows through the fluentd sidecar instead of streaming inserts.
        batch_load: bool,
    },
    Kafka {
        brokers: String,
        topic: String,
        serialization_format: String,
    },
}

// ── Enricher / Ensembler ──────────────────────────────────────────

/// A user container deployed as its own service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    pub resource_request: ResourceRequest,
    pub autoscaling_policy: AutoscalingPolicy,
    /// Path the router calls, e.g. "/enrich".
    pub endpoint: String,
    pub timeout: String,
    pub port: u16,
    pub env: Vec<EnvVar>,
    /// Name of the project secret holding the service account key.
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enricher {
    /// Assigned by the store when the owning version is created.
    pub id: EnricherId,
    #[serde(flatten)]
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ensembler {
    pub id: EnsemblerId,
    pub kind: EnsemblerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnsemblerKind {
    /// Runs inside the router; picks a route's response by experiment treatment.
    Standard {
        route_name_path: String,
        experiment_mappings: Vec<ExperimentMapping>,
        lazy_routing: bool,
    },
    Docker(ContainerConfig),
    /// Built from a registered python ensembler; the image builder is external.
    Pyfunc {
        ensembler_id: u64,
        resource_request: ResourceRequest,
        autoscaling_policy: AutoscalingPolicy,
        timeout: String,
        env: Vec<EnvVar>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentMapping {
    pub experiment: String,
    pub treatment: String,
    pub route: String,
}

// ── Event ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    DeployingDependencies,
    DeployingServices,
    DeploymentSuccess,
    DeploymentFailed,
    Rollback,
    UpdatingEndpoint,
    UndeployingServices,
    UndeployingDependencies,
    UndeployingPreviousVersion,
    UndeploymentSuccess,
    UndeploymentFailed,
    DeletionSuccess,
    DeletionFailed,
}

/// One entry of a router's append-only deployment log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub router_id: RouterId,
    pub version: u32,
    pub event_type: EventType,
    pub stage: EventStage,
    pub message: String,
    pub created_at: u64,
}

// ── Ensembling job ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Building,
    Running,
    Terminating,
    Terminated,
    Completed,
    Failed,
    FailedSubmission,
    FailedBuilding,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Terminated
                | JobStatus::Failed
                | JobStatus::FailedSubmission
                | JobStatus::FailedBuilding
                | JobStatus::Completed
        )
    }

    pub fn is_successful(&self) -> bool {
        *self == JobStatus::Completed
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Terminal states are final. Re-applying the current non-terminal status
    /// is allowed so that error messages can be updated.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Building | Running | FailedSubmission | Terminating),
            Building => matches!(
                next,
                Running | Pending | FailedBuilding | FailedSubmission | Terminating
            ),
            Running => matches!(next, Completed | Failed | Terminating),
            Terminating => matches!(next, Terminated),
            _ => false,
        }
    }
}

/// Where and with what the batch job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfraConfig {
    pub artifact_uri: String,
    pub ensembler_name: String,
    pub service_account_name: String,
    pub resources: JobResources,
    /// Image produced by the build step.
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResources {
    pub driver_cpu_request: String,
    pub driver_memory_request: String,
    pub executor_replica: u32,
    pub executor_cpu_request: String,
    pub executor_memory_request: String,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            driver_cpu_request: "1".to_string(),
            driver_memory_request: "1Gi".to_string(),
            executor_replica: 2,
            executor_cpu_request: "1".to_string(),
            executor_memory_request: "1Gi".to_string(),
        }
    }
}

/// Versioned pipeline definition handed to the batch runner unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub version: String,
    pub kind: String,
    pub name: String,
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsemblingJob {
    pub id: JobId,
    pub name: String,
    pub project_id: ProjectId,
    pub ensembler_id: EnsemblerId,
    pub environment_name: String,
    pub infra_config: InfraConfig,
    pub job_config: JobConfig,
    pub retry_count: u32,
    pub status: JobStatus,
    pub error: String,
    pub monitoring_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Building,
        JobStatus::Running,
        JobStatus::Terminating,
        JobStatus::Terminated,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::FailedSubmission,
        JobStatus::FailedBuilding,
    ];

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = ALL.iter().filter(|s| s.is_terminal()).copied().collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Terminated,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::FailedSubmission,
                JobStatus::FailedBuilding,
            ]
        );
    }

    #[test]
    fn only_completed_is_successful() {
        let successful: Vec<_> = ALL.iter().filter(|s| s.is_successful()).copied().collect();
        assert_eq!(successful, vec![JobStatus::Completed]);
    }

    #[test]
    fn terminal_statuses_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn happy_path_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Terminating));
        assert!(JobStatus::Terminating.can_transition_to(JobStatus::Terminated));
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Building.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Terminating.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn batched_logger_requires_batch_load() {
        let mut log = LogConfig::default();
        assert!(!log.uses_batched_logger());

        log.result_logger = ResultLogger::BigQuery {
            table: "p.d.t".to_string(),
            service_account_secret: "sa".to_string(),
            batch_load: false,
        };
        assert!(!log.uses_batched_logger());

        log.result_logger = ResultLogger::BigQuery {
            table: "p.d.t".to_string(),
            service_account_secret: "sa".to_string(),
            batch_load: true,
        };
        assert!(log.uses_batched_logger());
    }

    #[test]
    fn ensembler_kind_is_tagged() {
        let kind = EnsemblerKind::Standard {
            route_name_path: "policy.route".to_string(),
            experiment_mappings: vec![],
            lazy_routing: false,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "standard");
    }
}
