//! Deployment orchestrator.
//!
//! Sequences one router version onto its environment's cluster:
//! dependencies (namespace, secret, router config, batched logger) strictly
//! first, then the request-serving components concurrently, then the
//! routing rule. Never touches persisted state; the caller decides what a
//! result means for the router and version records.
//!
//! Each call runs under one deadline. When it passes, the in-flight work is
//! dropped, which aborts the cluster calls still running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use turing_cluster::{
    ClusterController, ClusterError, ClusterResult, ConfigMap, KubernetesService,
    PersistentVolumeClaim, Secret,
};
use turing_core::config::DeploymentConfig;
use turing_core::{ComponentKind, TuringConfig, naming};
use turing_state::{EventStage, Project};

use crate::builder::{ComponentSpec, DeploymentTarget, ResourceBuilder};
use crate::error::{DeployError, DeployResult};
use crate::events::EventWriter;
use crate::fanout::{self, FanOutError};

/// Everything a deploy submits, built up front.
struct VersionResources {
    secret: Secret,
    config_map: ConfigMap,
    components: Vec<ComponentSpec>,
    logger: Option<(PersistentVolumeClaim, KubernetesService)>,
}

pub struct DeploymentService {
    config: DeploymentConfig,
    builder: ResourceBuilder,
    controllers: HashMap<String, Arc<dyn ClusterController>>,
}

impl DeploymentService {
    /// `controllers` maps each environment name to the controller of its cluster.
    ///
    /// The keys must be exactly the environments listed in `config`.
    pub fn new(
        config: &TuringConfig,
        controllers: HashMap<String, Arc<dyn ClusterController>>,
    ) -> DeployResult<Self> {
        for name in controllers.keys() {
            if config.environment(name).is_none() {
                return Err(DeployError::Environments(format!(
                    "controller given for unconfigured environment {name}"
                )));
            }
        }
        for env in &config.environments {
            if !controllers.contains_key(&env.name) {
                return Err(DeployError::Environments(format!(
                    "environment {} (cluster {}) has no controller",
                    env.name, env.cluster
                )));
            }
            info!(environment = %env.name, cluster = %env.cluster, "cluster controller registered");
        }
        Ok(Self {
            config: config.deployment.clone(),
            builder: ResourceBuilder::new(config),
            controllers,
        })
    }

    pub fn builder(&self) -> &ResourceBuilder {
        &self.builder
    }

    pub fn has_environment(&self, environment: &str) -> bool {
        self.controllers.contains_key(environment)
    }

    fn controller(&self, environment: &str) -> DeployResult<Arc<dyn ClusterController>> {
        self.controllers
            .get(environment)
            .cloned()
            .ok_or_else(|| DeployError::UnknownEnvironment(environment.to_string()))
    }

    /// Deploy a version and route its router's endpoint to it.
    ///
    /// Returns the router's stable endpoint. Resources created before a
    /// failure are left in place.
    pub async fn deploy_router_version(
        &self,
        target: &DeploymentTarget<'_>,
        events: &EventWriter,
    ) -> DeployResult<String> {
        let cluster = self.controller(target.environment)?;
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        info!(
            router = target.router_name,
            version = target.version.version,
            environment = target.environment,
            "deploying router version"
        );

        let result = match tokio::time::timeout_at(
            deadline,
            self.deploy(cluster, target, events, deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let e = DeployError::Timeout {
                    operation: "deployment",
                    timeout,
                };
                events.error(EventStage::DeploymentFailed, e.to_string());
                Err(e)
            }
        };

        match &result {
            Ok(endpoint) => {
                events.info(
                    EventStage::DeploymentSuccess,
                    format!(
                        "Router version {} is live at {endpoint}",
                        target.version.version
                    ),
                );
                info!(router = target.router_name, version = target.version.version, %endpoint, "router version deployed");
            }
            Err(e) => {
                error!(router = target.router_name, version = target.version.version, error = %e, "router version deployment failed");
            }
        }
        result
    }

    async fn deploy(
        &self,
        cluster: Arc<dyn ClusterController>,
        target: &DeploymentTarget<'_>,
        events: &EventWriter,
        deadline: Instant,
    ) -> DeployResult<String> {
        let namespace = target.namespace();

        // Every spec is built before the first cluster call.
        let VersionResources {
            secret,
            config_map,
            components,
            logger,
        } = match self.build_all(target) {
            Ok(resources) => resources,
            Err(e) => {
                events.error(EventStage::DeploymentFailed, e.to_string());
                return Err(e);
            }
        };

        events.info(
            EventStage::DeployingDependencies,
            format!("Creating namespace {namespace}"),
        );
        match cluster.create_namespace(&namespace).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => debug!(%namespace, "namespace already exists"),
            Err(source) => return Err(dependency_failed(events, "create namespace", source)),
        }

        events.info(
            EventStage::DeployingDependencies,
            format!("Creating secret {}", secret.name),
        );
        cluster
            .create_secret(&secret)
            .await
            .map_err(|source| dependency_failed(events, "create secret", source))?;

        events.info(
            EventStage::DeployingDependencies,
            format!("Applying router config {}", config_map.name),
        );
        cluster
            .apply_config_map(&config_map)
            .await
            .map_err(|source| dependency_failed(events, "apply router config", source))?;

        if let Some((claim, fluentd)) = &logger {
            events.info(
                EventStage::DeployingDependencies,
                format!("Deploying fluentd logger {}", fluentd.name),
            );
            cluster
                .apply_persistent_volume_claim(claim)
                .await
                .map_err(|source| {
                    dependency_failed(events, "provision fluentd volume claim", source)
                })?;
            cluster
                .deploy_kubernetes_service(fluentd)
                .await
                .map_err(|source| dependency_failed(events, "deploy fluentd logger", source))?;
        }

        let names: Vec<String> = components.iter().map(|c| c.service.name.clone()).collect();
        events.info(
            EventStage::DeployingServices,
            format!("Deploying services: {}", names.join(", ")),
        );
        let ops = components.into_iter().map(|component| {
            let cluster = cluster.clone();
            let service = component.service;
            let name = service.name.clone();
            let op = async move {
                cluster
                    .deploy_knative_service(&service)
                    .await
                    .map_err(|source| DeployError::Component {
                        component: service.name,
                        source,
                    })
            };
            (name, op)
        });
        let timeout = self.config.timeout();
        if let Err(failure) = fanout::first_failure(ops, remaining(deadline)).await {
            let e = from_fan_out(failure, "deployment", timeout);
            events.error(EventStage::DeployingServices, e.to_string());
            return Err(e);
        }
        debug!(services = ?names, "all services ready");

        // Re-resolve the router right before the routing rule moves.
        let router_service = naming::service_name(
            target.router_name,
            ComponentKind::Router,
            target.version.version,
        );
        events.info(
            EventStage::UpdatingEndpoint,
            format!("Resolving endpoint of {router_service}"),
        );
        let url = match cluster
            .get_knative_service_url(&router_service, &namespace)
            .await
        {
            Ok(url) => url,
            Err(source) => {
                let e = DeployError::Component {
                    component: router_service,
                    source,
                };
                events.error(EventStage::UpdatingEndpoint, e.to_string());
                return Err(e);
            }
        };

        let virtual_service = self.builder.virtual_service(target, &url);
        events.info(
            EventStage::UpdatingEndpoint,
            format!(
                "Routing {} to {}",
                virtual_service.hosts.join(", "),
                virtual_service.destination_host
            ),
        );
        cluster
            .apply_istio_virtual_service(&virtual_service)
            .await
            .map_err(|source| {
                let e = DeployError::Dependency {
                    step: "update routing rule",
                    source,
                };
                events.error(EventStage::UpdatingEndpoint, e.to_string());
                e
            })?;

        Ok(self.builder.endpoint(target.router_name, &namespace))
    }

    fn build_all(&self, target: &DeploymentTarget<'_>) -> DeployResult<VersionResources> {
        let components = self.builder.components(target)?;
        let config_map = self.builder.router_config_map(target)?;
        let logger = if target.version.log_config.uses_batched_logger() {
            Some((
                self.builder.fluentd_claim(target),
                self.builder.fluentd_service(target)?,
            ))
        } else {
            None
        };
        Ok(VersionResources {
            secret: self.builder.secret(target),
            config_map,
            components,
            logger,
        })
    }

    /// Delete every resource a version owns, except the routing rule.
    ///
    /// Attempts every deletion regardless of earlier failures and reports
    /// all of them together. Resources that are already gone count as deleted.
    pub async fn undeploy_router_version(
        &self,
        target: &DeploymentTarget<'_>,
        events: &EventWriter,
    ) -> DeployResult<()> {
        let cluster = self.controller(target.environment)?;
        let timeout = self.config.deletion_timeout();
        let deadline = Instant::now() + timeout;
        let namespace = target.namespace();
        let version = target.version.version;
        info!(router = target.router_name, version, "undeploying router version");

        let names = ResourceBuilder::component_names(target.router_name, target.version);
        events.info(
            EventStage::UndeployingServices,
            format!("Deleting services: {}", names.join(", ")),
        );
        let ops = names.into_iter().map(|name| {
            let cluster = cluster.clone();
            let namespace = namespace.clone();
            let label = name.clone();
            let op = async move {
                match cluster.delete_knative_service(&name, &namespace).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(source) => Err(DeployError::Component {
                        component: name,
                        source,
                    }),
                }
            };
            (label, op)
        });
        // Services still being deleted at the deadline are reported by name.
        let mut failures: Vec<String> = Vec::new();
        for failure in fanout::all_failures(ops, remaining(deadline)).await {
            match failure {
                FanOutError::Timeout { pending } => failures.extend(
                    pending
                        .into_iter()
                        .map(|name| format!("{name}: deletion timed out after {timeout:?}")),
                ),
                other => failures.push(from_fan_out(other, "undeployment", timeout).to_string()),
            }
        }

        events.info(
            EventStage::UndeployingDependencies,
            format!("Deleting dependencies of version {version}"),
        );
        if target.version.log_config.uses_batched_logger() {
            let fluentd =
                naming::service_name(target.router_name, ComponentKind::FluentdLogger, version);
            failures.extend(
                best_effort(
                    deadline,
                    &fluentd,
                    cluster.delete_kubernetes_service(&fluentd, &namespace),
                )
                .await,
            );
            let claim = naming::pvc_name(target.router_name, version);
            failures.extend(
                best_effort(
                    deadline,
                    &claim,
                    cluster.delete_persistent_volume_claim(&claim, &namespace),
                )
                .await,
            );
        }
        let config_map = naming::config_map_name(target.router_name, version);
        failures.extend(
            best_effort(
                deadline,
                &config_map,
                cluster.delete_config_map(&config_map, &namespace),
            )
            .await,
        );
        let secret = naming::secret_name(target.router_name, version);
        failures.extend(
            best_effort(
                deadline,
                &secret,
                cluster.delete_secret(&secret, &namespace),
            )
            .await,
        );

        if failures.is_empty() {
            events.info(
                EventStage::UndeploymentSuccess,
                format!("Router version {version} undeployed"),
            );
            info!(router = target.router_name, version, "router version undeployed");
            return Ok(());
        }
        for failure in &failures {
            events.error(EventStage::UndeploymentFailed, failure.clone());
        }
        warn!(
            router = target.router_name,
            version,
            failed = failures.len(),
            "router version undeployed with leftover resources"
        );
        Err(DeployError::Undeploy(failures))
    }

    /// Remove the routing rule that exposes a router's stable endpoint.
    pub async fn delete_router_endpoint(
        &self,
        project: &Project,
        environment: &str,
        router_name: &str,
        events: &EventWriter,
    ) -> DeployResult<()> {
        let cluster = self.controller(environment)?;
        let timeout = self.config.deletion_timeout();
        let namespace = naming::namespace(&project.name);
        let name = naming::virtual_service_name(router_name);
        events.info(
            EventStage::UpdatingEndpoint,
            format!("Deleting routing rule {name}"),
        );

        let result = match tokio::time::timeout(
            timeout,
            cluster.delete_istio_virtual_service(&name, &namespace),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => Ok(()),
            Ok(Err(source)) => Err(DeployError::Dependency {
                step: "delete routing rule",
                source,
            }),
            Err(_) => Err(DeployError::Timeout {
                operation: "routing rule deletion",
                timeout,
            }),
        };
        if let Err(e) = &result {
            events.error(EventStage::UpdatingEndpoint, e.to_string());
        }
        result
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn dependency_failed(events: &EventWriter, step: &'static str, source: ClusterError) -> DeployError {
    let e = DeployError::Dependency { step, source };
    events.error(EventStage::DeployingDependencies, e.to_string());
    e
}

fn from_fan_out(
    failure: FanOutError<DeployError>,
    operation: &'static str,
    timeout: Duration,
) -> DeployError {
    match failure {
        FanOutError::Failed(e) => e,
        FanOutError::Timeout { .. } => DeployError::Timeout { operation, timeout },
        FanOutError::Panicked { label, message } => DeployError::TaskPanicked {
            component: label,
            message,
        },
    }
}

/// Run one teardown call under the deadline. Returns the failure, if any.
async fn best_effort<F>(deadline: Instant, name: &str, call: F) -> Option<String>
where
    F: Future<Output = ClusterResult<()>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) if e.is_not_found() => None,
        Ok(Err(e)) => Some(format!("{name}: {e}")),
        Err(_) => Some(format!("{name}: deletion timed out")),
    }
}

#[cfg(test)]
mod tests {
    use turing_cluster::{ClusterOp, InMemoryController};
    use turing_core::config::EnvironmentConfig;
    use turing_state::{
        AutoscalingPolicy, ContainerConfig, Enricher, Ensembler, EnsemblerKind, EventType,
        ExperimentConfig, LogConfig, Protocol, ResourceRequest, ResultLogger, RouterVersion,
        RouterVersionStatus,
    };

    use super::*;
    use crate::builder::DeploymentSecrets;
    use crate::events::{ProgressEvent, event_channel};

    static NO_EXPERIMENT: serde_json::Value = serde_json::Value::Null;

    fn project() -> Project {
        Project {
            id: 1,
            name: "risk".to_string(),
            team: "fraud-team".to_string(),
            stream: "payments".to_string(),
        }
    }

    fn container(image: &str) -> ContainerConfig {
        ContainerConfig {
            image: image.to_string(),
            resource_request: ResourceRequest::default(),
            autoscaling_policy: AutoscalingPolicy::default(),
            endpoint: "/".to_string(),
            timeout: "60ms".to_string(),
            port: 8080,
            env: vec![],
            service_account: None,
        }
    }

    fn full_version() -> RouterVersion {
        RouterVersion {
            id: 1,
            router_id: 1,
            version: 1,
            status: RouterVersionStatus::Pending,
            error: String::new(),
            image: String::new(),
            routes: vec![],
            default_route_id: None,
            rules: vec![],
            experiment_engine: ExperimentConfig::default(),
            resource_request: ResourceRequest::default(),
            autoscaling_policy: AutoscalingPolicy::default(),
            timeout: "100ms".to_string(),
            protocol: Protocol::Http,
            log_config: LogConfig::default(),
            enricher: Some(Enricher {
                id: 1,
                container: container("enricher:1"),
            }),
            ensembler: Some(Ensembler {
                id: 1,
                kind: EnsemblerKind::Docker(container("ensembler:1")),
            }),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn staging() -> EnvironmentConfig {
        EnvironmentConfig {
            name: "staging".to_string(),
            cluster: "staging-cluster".to_string(),
        }
    }

    fn service(cluster: &InMemoryController, mut config: TuringConfig) -> DeploymentService {
        config.environments = vec![staging()];
        let controller: Arc<dyn ClusterController> = Arc::new(cluster.clone());
        DeploymentService::new(
            &config,
            HashMap::from([("staging".to_string(), controller)]),
        )
        .unwrap()
    }

    fn target<'a>(
        project: &'a Project,
        version: &'a RouterVersion,
        secrets: &'a DeploymentSecrets,
    ) -> DeploymentTarget<'a> {
        DeploymentTarget {
            project,
            environment: "staging",
            router_name: "fraud",
            version,
            secrets,
            experiment_config: &NO_EXPERIMENT,
        }
    }

    fn errors(events: &[ProgressEvent]) -> Vec<&ProgressEvent> {
        events
            .iter()
            .filter(|e| e.event_type == EventType::Error)
            .collect()
    }

    #[tokio::test]
    async fn deploy_all_components_then_route() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, mut reader) = event_channel(64);

        let endpoint = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap();
        assert_eq!(endpoint, "http://fraud-turing-router.risk.models.local");

        let ops = cluster.operations();
        assert_eq!(ops[0], ClusterOp::CreateNamespace("risk".to_string()));
        assert_eq!(
            ops[1],
            ClusterOp::CreateSecret("fraud-turing-secret-1".to_string())
        );
        assert_eq!(
            ops[2],
            ClusterOp::ApplyConfigMap("fraud-turing-fiber-config-1".to_string())
        );
        let mut deployed: Vec<_> = ops[3..6].to_vec();
        deployed.sort_by_key(|op| format!("{op:?}"));
        assert_eq!(
            deployed,
            vec![
                ClusterOp::DeployKnativeService("fraud-turing-enricher-1".to_string()),
                ClusterOp::DeployKnativeService("fraud-turing-ensembler-1".to_string()),
                ClusterOp::DeployKnativeService("fraud-turing-router-1".to_string()),
            ]
        );
        assert_eq!(
            ops[6],
            ClusterOp::ApplyVirtualService("fraud-turing-router".to_string())
        );

        let vs = cluster.virtual_service("fraud-turing-router", "risk").unwrap();
        assert_eq!(vs.destination_host, "fraud-turing-router-1.risk.svc.cluster.local");

        let events = reader.drain();
        assert!(errors(&events).is_empty());
        assert_eq!(events[0].stage, EventStage::DeployingDependencies);
        assert_eq!(events.last().unwrap().stage, EventStage::DeploymentSuccess);
    }

    #[test]
    fn controllers_must_match_configured_environments() {
        let controller: Arc<dyn ClusterController> = Arc::new(InMemoryController::default());
        let controllers = HashMap::from([("staging".to_string(), controller)]);

        let err = DeploymentService::new(&TuringConfig::default(), controllers.clone())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unconfigured environment staging"), "{err}");

        let mut config = TuringConfig::default();
        config.environments = vec![
            staging(),
            EnvironmentConfig {
                name: "production".to_string(),
                cluster: "prod-cluster".to_string(),
            },
        ];
        let err = DeploymentService::new(&config, controllers.clone())
            .err()
            .unwrap();
        assert!(err.to_string().contains("production (cluster prod-cluster)"), "{err}");

        config.environments.truncate(1);
        let svc = DeploymentService::new(&config, controllers).unwrap();
        assert!(svc.has_environment("staging"));
        assert!(!svc.has_environment("production"));
    }

    #[tokio::test]
    async fn unknown_environment_fails_without_events() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let mut t = target(&project, &version, &secrets);
        t.environment = "production";
        let (writer, mut reader) = event_channel(64);

        let err = svc.deploy_router_version(&t, &writer).await.unwrap_err();
        assert!(matches!(err, DeployError::UnknownEnvironment(ref env) if env == "production"));
        assert!(reader.drain().is_empty());
        assert!(cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn existing_namespace_is_not_an_error() {
        let cluster = InMemoryController::default();
        cluster.create_namespace("risk").await.unwrap();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, _reader) = event_channel(64);

        svc.deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unresolvable_router_url_leaves_routing_untouched() {
        let cluster = InMemoryController::default();
        cluster.fail_url_lookup("fraud-turing-router-1");
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, mut reader) = event_channel(64);

        let err = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap_err();
        assert!(
            matches!(err, DeployError::Component { ref component, .. } if component == "fraud-turing-router-1"),
            "{err:?}"
        );
        assert!(cluster.knative_service("fraud-turing-router-1", "risk").is_some());
        assert!(cluster.virtual_service("fraud-turing-router", "risk").is_none());

        let events = reader.drain();
        let errs = errors(&events);
        assert!(errs.iter().any(|e| e.stage == EventStage::UpdatingEndpoint
            && e.message.contains("fraud-turing-router-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn first_component_failure_short_circuits() {
        let cluster = InMemoryController::default();
        cluster.inject_failure("fraud-turing-ensembler");
        cluster.set_latency("fraud-turing-enricher", Duration::from_secs(30));
        cluster.set_latency("fraud-turing-router-", Duration::from_secs(30));
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, mut reader) = event_channel(64);

        let start = Instant::now();
        let err = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(
            matches!(err, DeployError::Component { ref component, .. } if component == "fraud-turing-ensembler-1")
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cluster.knative_service("fraud-turing-router-1", "risk").is_none());
        assert!(cluster.virtual_service("fraud-turing-router", "risk").is_none());

        let events = reader.drain();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("fraud-turing-ensembler-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_slow_components() {
        let cluster = InMemoryController::default();
        cluster.set_latency("fraud-turing-router-", Duration::from_secs(600));
        let mut config = TuringConfig::default();
        config.deployment.timeout_secs = 10;
        let svc = service(&cluster, config);
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, mut reader) = event_channel(64);

        let err = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "deployment timed out after 10s");

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert!(cluster.knative_service("fraud-turing-router-1", "risk").is_none());
        assert!(!errors(&reader.drain()).is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_never_reaches_the_cluster() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, mut version, secrets) =
            (project(), full_version(), DeploymentSecrets::default());
        version.resource_request.cpu_request = "a lot".to_string();
        let (writer, mut reader) = event_channel(64);

        let err = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Build(_)));
        assert!(cluster.operations().is_empty());
        assert_eq!(errors(&reader.drain()).len(), 1);
    }

    #[tokio::test]
    async fn dependency_failure_aborts_before_services() {
        let cluster = InMemoryController::default();
        cluster.inject_failure("fraud-turing-secret");
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, _reader) = event_channel(64);

        let err = svc
            .deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Dependency { step: "create secret", .. }));
        assert!(cluster.knative_service_names("risk").is_empty());
    }

    #[tokio::test]
    async fn batched_logger_is_deployed_before_components() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, mut version, secrets) =
            (project(), full_version(), DeploymentSecrets::default());
        version.log_config.result_logger = ResultLogger::BigQuery {
            table: "p.d.t".to_string(),
            service_account_secret: "sa".to_string(),
            batch_load: true,
        };
        let (writer, _reader) = event_channel(64);

        svc.deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap();

        let ops = cluster.operations();
        assert_eq!(
            ops[3],
            ClusterOp::ApplyPersistentVolumeClaim("fraud-turing-fluentd-logger-pvc-1".to_string())
        );
        assert_eq!(
            ops[4],
            ClusterOp::DeployKubernetesService("fraud-turing-fluentd-logger-1".to_string())
        );
        assert!(matches!(ops[5], ClusterOp::DeployKnativeService(_)));
    }

    #[tokio::test]
    async fn undeploy_attempts_everything_and_joins_failures() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let t = target(&project, &version, &secrets);
        let (writer, mut reader) = event_channel(64);
        svc.deploy_router_version(&t, &writer).await.unwrap();
        reader.drain();

        cluster.inject_failure("fraud-turing-enricher-1");
        cluster.inject_failure("fraud-turing-ensembler-1");
        let err = svc.undeploy_router_version(&t, &writer).await.unwrap_err();

        let DeployError::Undeploy(failures) = &err else {
            panic!("unexpected {err:?}");
        };
        assert_eq!(failures.len(), 2);
        let message = err.to_string();
        assert!(message.contains("fraud-turing-enricher-1"));
        assert!(message.contains("fraud-turing-ensembler-1"));
        assert!(message.contains("; "));

        assert!(cluster.knative_service("fraud-turing-router-1", "risk").is_none());
        assert!(cluster.secret("fraud-turing-secret-1", "risk").is_none());
        assert_eq!(errors(&reader.drain()).len(), 2);
    }

    #[tokio::test]
    async fn undeploy_of_missing_resources_succeeds() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, mut reader) = event_channel(64);

        svc.undeploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap();
        assert_eq!(
            reader.drain().last().unwrap().stage,
            EventStage::UndeploymentSuccess
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undeploy_reports_timeout_with_other_failures() {
        let cluster = InMemoryController::default();
        let mut config = TuringConfig::default();
        config.deployment.deletion_timeout_secs = 5;
        let svc = service(&cluster, config);
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let t = target(&project, &version, &secrets);
        let (writer, _reader) = event_channel(64);
        svc.deploy_router_version(&t, &writer).await.unwrap();

        cluster.set_latency("fraud-turing-router-1", Duration::from_secs(60));
        cluster.inject_failure("fraud-turing-enricher-1");
        let err = svc.undeploy_router_version(&t, &writer).await.unwrap_err();

        let DeployError::Undeploy(failures) = &err else {
            panic!("unexpected {err:?}");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|f| f.starts_with("fraud-turing-enricher-1: ")));
        assert!(failures.contains(&"fraud-turing-router-1: deletion timed out after 5s".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn undeploy_timeout_names_every_service_left_behind() {
        let cluster = InMemoryController::default();
        let mut config = TuringConfig::default();
        config.deployment.deletion_timeout_secs = 5;
        let svc = service(&cluster, config);
        let (project, mut version, secrets) =
            (project(), full_version(), DeploymentSecrets::default());
        version.enricher = None;
        version.ensembler = None;
        let t = target(&project, &version, &secrets);
        let (writer, mut reader) = event_channel(64);
        svc.deploy_router_version(&t, &writer).await.unwrap();
        reader.drain();

        cluster.set_latency("fraud-turing-router-1", Duration::from_secs(60));
        let err = svc.undeploy_router_version(&t, &writer).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "fraud-turing-router-1: deletion timed out after 5s"
        );
        let events = reader.drain();
        assert!(errors(&events)
            .iter()
            .any(|e| e.message.contains("fraud-turing-router-1")));
    }

    #[tokio::test]
    async fn delete_router_endpoint_is_idempotent() {
        let cluster = InMemoryController::default();
        let svc = service(&cluster, TuringConfig::default());
        let (project, version, secrets) = (project(), full_version(), DeploymentSecrets::default());
        let (writer, _reader) = event_channel(64);
        svc.deploy_router_version(&target(&project, &version, &secrets), &writer)
            .await
            .unwrap();

        svc.delete_router_endpoint(&project, "staging", "fraud", &writer)
            .await
            .unwrap();
        assert!(cluster.virtual_service("fraud-turing-router", "risk").is_none());
        svc.delete_router_endpoint(&project, "staging", "fraud", &writer)
            .await
            .unwrap();
    }
}
