//! Resource builder.
//!
//! Maps a router version, its project and the deployment secrets to the
//! cluster resources that run it. Pure: no I/O, no clock, same input gives
//! the same specs. Resource requests are validated here, so a version with
//! an unusable request fails before anything reaches the cluster.

use std::collections::BTreeMap;

use turing_cluster::{
    ConfigMap, ConfigMapMount, KnativeService, KubernetesService, PersistentVolumeClaim, Secret,
    SecretMount, VirtualService, VolumeClaimMount,
};
use turing_core::config::{DeploymentConfig, RouterDefaults};
use turing_core::{ComponentKind, TuringConfig, naming};
use turing_state::{
    AutoscalingMetric, AutoscalingPolicy, ContainerConfig, EnsemblerKind, Project, Protocol,
    ResourceRequest, ResultLogger, RouterVersion,
};

use crate::error::{DeployError, DeployResult};

pub const ENRICHER_SECRET_KEY: &str = "enricher-service-account.json";
pub const ENSEMBLER_SECRET_KEY: &str = "ensembler-service-account.json";
pub const ROUTER_SECRET_KEY: &str = "router-service-account.json";
pub const EXPERIMENT_PASSKEY_KEY: &str = "experiment_passkey";

const SECRET_MOUNT_DIR: &str = "/var/secret";
const ROUTER_CONFIG_DIR: &str = "/app/config";
const ROUTER_CONFIG_FILE: &str = "fiber.json";
const FLUENTD_PORT: u16 = 24224;
const FLUENTD_CACHE_DIR: &str = "/cache";
const ISTIO_GATEWAY: &str = "knative-serving/knative-ingress-gateway";

const QUANTITY_SUFFIXES: &[&str] = &["", "m", "k", "M", "G", "T", "Ki", "Mi", "Gi", "Ti"];

/// Credentials resolved by the caller for one deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentSecrets {
    pub enricher_service_account: Option<String>,
    pub ensembler_service_account: Option<String>,
    /// Used by the result logger.
    pub router_service_account: Option<String>,
    pub experiment_passkey: Option<String>,
}

/// Everything needed to deploy or tear down one router version.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentTarget<'a> {
    pub project: &'a Project,
    pub environment: &'a str,
    pub router_name: &'a str,
    pub version: &'a RouterVersion,
    pub secrets: &'a DeploymentSecrets,
    /// Experiment engine config with runtime values already resolved.
    pub experiment_config: &'a serde_json::Value,
}

impl DeploymentTarget<'_> {
    pub fn namespace(&self) -> String {
        naming::namespace(&self.project.name)
    }

    fn service_name(&self, kind: ComponentKind) -> String {
        naming::service_name(self.router_name, kind, self.version.version)
    }
}

/// One request-serving component of a router version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub kind: ComponentKind,
    pub service: KnativeService,
}

#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    router: RouterDefaults,
    deployment: DeploymentConfig,
}

impl ResourceBuilder {
    pub fn new(config: &TuringConfig) -> Self {
        Self {
            router: config.router.clone(),
            deployment: config.deployment.clone(),
        }
    }

    /// The secret shared by every component of the version.
    pub fn secret(&self, target: &DeploymentTarget<'_>) -> Secret {
        let secrets = target.secrets;
        let data = [
            (ENRICHER_SECRET_KEY, &secrets.enricher_service_account),
            (ENSEMBLER_SECRET_KEY, &secrets.ensembler_service_account),
            (ROUTER_SECRET_KEY, &secrets.router_service_account),
            (EXPERIMENT_PASSKEY_KEY, &secrets.experiment_passkey),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect();

        Secret {
            name: naming::secret_name(target.router_name, target.version.version),
            namespace: target.namespace(),
            data,
        }
    }

    /// The router's route table, traffic rules and experiment setup.
    pub fn router_config_map(&self, target: &DeploymentTarget<'_>) -> DeployResult<ConfigMap> {
        let version = target.version;
        let standard_ensembler = match version.ensembler.as_ref().map(|e| &e.kind) {
            Some(kind @ EnsemblerKind::Standard { .. }) => Some(kind),
            _ => None,
        };
        let document = serde_json::json!({
            "id": format!("{}-{}", target.router_name, version.version),
            "routes": version.routes,
            "default_route_id": version.default_route_id,
            "rules": version.rules,
            "ensembler": standard_ensembler,
            "experiment_engine": {
                "type": version.experiment_engine.engine_type,
                "config": target.experiment_config,
            },
        });
        let rendered = serde_json::to_string_pretty(&document)
            .map_err(|e| DeployError::Build(format!("router config: {e}")))?;

        Ok(ConfigMap {
            name: naming::config_map_name(target.router_name, version.version),
            namespace: target.namespace(),
            data: BTreeMap::from([(ROUTER_CONFIG_FILE.to_string(), rendered)]),
        })
    }

    /// Enricher (if configured), docker ensembler (if configured) and router,
    /// in that order.
    pub fn components(&self, target: &DeploymentTarget<'_>) -> DeployResult<Vec<ComponentSpec>> {
        let version = target.version;
        let mut components = Vec::with_capacity(3);

        if let Some(enricher) = &version.enricher {
            let service = self.container_service(
                target,
                ComponentKind::Enricher,
                &enricher.container,
                target
                    .secrets
                    .enricher_service_account
                    .as_ref()
                    .map(|_| ENRICHER_SECRET_KEY),
            )?;
            components.push(ComponentSpec {
                kind: ComponentKind::Enricher,
                service,
            });
        }

        match version.ensembler.as_ref().map(|e| &e.kind) {
            Some(EnsemblerKind::Docker(container)) => {
                let service = self.container_service(
                    target,
                    ComponentKind::Ensembler,
                    container,
                    target
                        .secrets
                        .ensembler_service_account
                        .as_ref()
                        .map(|_| ENSEMBLER_SECRET_KEY),
                )?;
                components.push(ComponentSpec {
                    kind: ComponentKind::Ensembler,
                    service,
                });
            }
            Some(EnsemblerKind::Pyfunc { ensembler_id, .. }) => {
                return Err(DeployError::Build(format!(
                    "pyfunc ensembler {ensembler_id} has no built image"
                )));
            }
            Some(EnsemblerKind::Standard { .. }) | None => {}
        }

        components.push(ComponentSpec {
            kind: ComponentKind::Router,
            service: self.router_service(target)?,
        });
        Ok(components)
    }

    /// Names of the services a version may own, whether or not its spec
    /// is valid. Used for teardown.
    pub fn component_names(router_name: &str, version: &RouterVersion) -> Vec<String> {
        let mut names = Vec::with_capacity(3);
        if version.enricher.is_some() {
            names.push(naming::service_name(
                router_name,
                ComponentKind::Enricher,
                version.version,
            ));
        }
        if version.has_docker_ensembler() {
            names.push(naming::service_name(
                router_name,
                ComponentKind::Ensembler,
                version.version,
            ));
        }
        names.push(naming::service_name(
            router_name,
            ComponentKind::Router,
            version.version,
        ));
        names
    }

    pub fn fluentd_claim(&self, target: &DeploymentTarget<'_>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            name: naming::pvc_name(target.router_name, target.version.version),
            namespace: target.namespace(),
            storage: self.deployment.pvc_size.clone(),
            access_modes: vec!["ReadWriteOnce".to_string()],
        }
    }

    /// The sidecar that batch-loads router results into BigQuery.
    pub fn fluentd_service(&self, target: &DeploymentTarget<'_>) -> DeployResult<KubernetesService> {
        let ResultLogger::BigQuery { table, .. } = &target.version.log_config.result_logger else {
            return Err(DeployError::Build(
                "fluentd logger requires a BigQuery result logger".to_string(),
            ));
        };
        let fluentd = &self.deployment.fluentd;
        let mut env = BTreeMap::from([
            ("FLUENTD_BQ_TABLE".to_string(), table.clone()),
            (
                "FLUENTD_FLUSH_INTERVAL_SECONDS".to_string(),
                fluentd.flush_interval_secs.to_string(),
            ),
            (
                "FLUENTD_LOG_PATH".to_string(),
                format!("{FLUENTD_CACHE_DIR}/log/bq_load_logs.*.buffer"),
            ),
            ("FLUENTD_TAG".to_string(), fluentd_tag(target)),
        ]);
        let mut secret_mounts = Vec::new();
        if target.secrets.router_service_account.is_some() {
            let mount = secret_mount(target, ROUTER_SECRET_KEY);
            env.insert(
                "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                mount.mount_path.clone(),
            );
            secret_mounts.push(mount);
        }

        Ok(KubernetesService {
            name: target.service_name(ComponentKind::FluentdLogger),
            namespace: target.namespace(),
            image: format!("{}:{}", fluentd.image, fluentd.tag),
            port: FLUENTD_PORT,
            replicas: 1,
            env,
            labels: labels(target, ComponentKind::FluentdLogger),
            cpu_request: "1".to_string(),
            memory_request: "512Mi".to_string(),
            volume_claim: Some(VolumeClaimMount {
                claim_name: naming::pvc_name(target.router_name, target.version.version),
                mount_path: FLUENTD_CACHE_DIR.to_string(),
            }),
            secret_mounts,
        })
    }

    /// Points the router's stable host at one version's router service.
    pub fn virtual_service(
        &self,
        target: &DeploymentTarget<'_>,
        router_service_url: &str,
    ) -> VirtualService {
        let namespace = target.namespace();
        let destination = router_service_url
            .split_once("://")
            .map_or(router_service_url, |(_, rest)| rest)
            .trim_end_matches('/');
        VirtualService {
            name: naming::virtual_service_name(target.router_name),
            hosts: vec![self.router_host(target.router_name, &namespace)],
            namespace,
            gateway: ISTIO_GATEWAY.to_string(),
            destination_host: destination.to_string(),
            labels: labels(target, ComponentKind::Router),
        }
    }

    /// The stable endpoint clients call.
    pub fn endpoint(&self, router_name: &str, namespace: &str) -> String {
        format!("http://{}", self.router_host(router_name, namespace))
    }

    fn router_host(&self, router_name: &str, namespace: &str) -> String {
        naming::router_host(router_name, namespace, &self.router.domain)
    }

    fn container_service(
        &self,
        target: &DeploymentTarget<'_>,
        kind: ComponentKind,
        container: &ContainerConfig,
        secret_key: Option<&str>,
    ) -> DeployResult<KnativeService> {
        let name = target.service_name(kind);
        validate_resources(&name, &container.resource_request, &container.autoscaling_policy)?;

        let mut env: BTreeMap<String, String> = container
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect();
        let mut secret_mounts = Vec::new();
        if let Some(key) = secret_key {
            let mount = secret_mount(target, key);
            env.insert(
                "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                mount.mount_path.clone(),
            );
            secret_mounts.push(mount);
        }

        Ok(knative_service(
            target,
            kind,
            &container.image,
            container.port,
            env,
            &container.resource_request,
            &container.autoscaling_policy,
            secret_mounts,
            Vec::new(),
        ))
    }

    fn router_service(&self, target: &DeploymentTarget<'_>) -> DeployResult<KnativeService> {
        let version = target.version;
        let name = target.service_name(ComponentKind::Router);
        validate_resources(&name, &version.resource_request, &version.autoscaling_policy)?;

        let namespace = target.namespace();
        let log_config = &version.log_config;
        let mut env = BTreeMap::from([
            (
                "APP_NAME".to_string(),
                format!("{}-{}.{}", target.router_name, version.version, target.project.name),
            ),
            ("APP_ENVIRONMENT".to_string(), target.environment.to_string()),
            ("APP_LOGLEVEL".to_string(), log_config.log_level.clone()),
            (
                "APP_CUSTOM_METRICS".to_string(),
                log_config.custom_metrics_enabled.to_string(),
            ),
            (
                "APP_FIBER_DEBUG_LOG".to_string(),
                log_config.fiber_debug_log_enabled.to_string(),
            ),
            (
                "APP_JAEGER_ENABLED".to_string(),
                log_config.jaeger_enabled.to_string(),
            ),
            ("ROUTER_TIMEOUT".to_string(), version.timeout.clone()),
            (
                "ROUTER_CONFIG_FILE".to_string(),
                format!("{ROUTER_CONFIG_DIR}/{ROUTER_CONFIG_FILE}"),
            ),
            (
                "ROUTER_PROTOCOL".to_string(),
                match version.protocol {
                    Protocol::Http => "HTTP_JSON",
                    Protocol::Upi => "UPI_V1",
                }
                .to_string(),
            ),
        ]);

        if let Some(enricher) = &version.enricher {
            env.insert(
                "ENRICHER_ENDPOINT".to_string(),
                cluster_local_url(
                    &target.service_name(ComponentKind::Enricher),
                    &namespace,
                    &enricher.container.endpoint,
                ),
            );
            env.insert(
                "ENRICHER_TIMEOUT".to_string(),
                enricher.container.timeout.clone(),
            );
        }
        if let Some(EnsemblerKind::Docker(container)) = version.ensembler.as_ref().map(|e| &e.kind)
        {
            env.insert(
                "ENSEMBLER_ENDPOINT".to_string(),
                cluster_local_url(
                    &target.service_name(ComponentKind::Ensembler),
                    &namespace,
                    &container.endpoint,
                ),
            );
            env.insert("ENSEMBLER_TIMEOUT".to_string(), container.timeout.clone());
        }

        let mut secret_mounts = Vec::new();
        match &log_config.result_logger {
            ResultLogger::Nop => {
                env.insert("APP_RESULT_LOGGER".to_string(), "nop".to_string());
            }
            ResultLogger::Console => {
                env.insert("APP_RESULT_LOGGER".to_string(), "console".to_string());
            }
            ResultLogger::BigQuery {
                table, batch_load, ..
            } => {
                env.insert("APP_RESULT_LOGGER".to_string(), "bigquery".to_string());
                env.insert("APP_BQ_TABLE".to_string(), table.clone());
                env.insert("APP_BQ_BATCH_LOAD".to_string(), batch_load.to_string());
                if *batch_load {
                    env.insert(
                        "APP_FLUENTD_HOST".to_string(),
                        format!(
                            "{}.{namespace}.svc.cluster.local",
                            target.service_name(ComponentKind::FluentdLogger)
                        ),
                    );
                    env.insert("APP_FLUENTD_PORT".to_string(), FLUENTD_PORT.to_string());
                    env.insert("APP_FLUENTD_TAG".to_string(), fluentd_tag(target));
                }
                if target.secrets.router_service_account.is_some() {
                    let mount = secret_mount(target, ROUTER_SECRET_KEY);
                    env.insert(
                        "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                        mount.mount_path.clone(),
                    );
                    secret_mounts.push(mount);
                }
            }
            ResultLogger::Kafka {
                brokers,
                topic,
                serialization_format,
            } => {
                env.insert("APP_RESULT_LOGGER".to_string(), "kafka".to_string());
                env.insert("APP_KAFKA_BROKERS".to_string(), brokers.clone());
                env.insert("APP_KAFKA_TOPIC".to_string(), topic.clone());
                env.insert(
                    "APP_KAFKA_SERIALIZATION_FORMAT".to_string(),
                    serialization_format.clone(),
                );
            }
        }
        if target.secrets.experiment_passkey.is_some() {
            secret_mounts.push(secret_mount(target, EXPERIMENT_PASSKEY_KEY));
        }

        let image = if version.image.is_empty() {
            &self.router.image
        } else {
            &version.image
        };
        Ok(knative_service(
            target,
            ComponentKind::Router,
            image,
            self.router.port,
            env,
            &version.resource_request,
            &version.autoscaling_policy,
            secret_mounts,
            vec![ConfigMapMount {
                config_map_name: naming::config_map_name(target.router_name, version.version),
                mount_path: ROUTER_CONFIG_DIR.to_string(),
            }],
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn knative_service(
    target: &DeploymentTarget<'_>,
    kind: ComponentKind,
    image: &str,
    port: u16,
    env: BTreeMap<String, String>,
    resources: &ResourceRequest,
    autoscaling: &AutoscalingPolicy,
    secret_mounts: Vec<SecretMount>,
    config_map_mounts: Vec<ConfigMapMount>,
) -> KnativeService {
    KnativeService {
        name: target.service_name(kind),
        namespace: target.namespace(),
        image: image.to_string(),
        port,
        env,
        labels: labels(target, kind),
        cpu_request: resources.cpu_request.clone(),
        memory_request: resources.memory_request.clone(),
        cpu_limit: resources.cpu_limit.clone(),
        min_replicas: resources.min_replica,
        max_replicas: resources.max_replica,
        autoscaling_metric: metric_name(autoscaling.metric).to_string(),
        autoscaling_target: autoscaling.target.clone(),
        http2: target.version.protocol == Protocol::Upi,
        secret_mounts,
        config_map_mounts,
    }
}

fn labels(target: &DeploymentTarget<'_>, kind: ComponentKind) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), target.router_name.to_string()),
        ("component".to_string(), kind.to_string()),
        ("version".to_string(), target.version.version.to_string()),
        ("environment".to_string(), target.environment.to_string()),
        ("team".to_string(), target.project.team.clone()),
        ("stream".to_string(), target.project.stream.clone()),
        ("orchestrator".to_string(), "turing".to_string()),
    ])
}

fn secret_mount(target: &DeploymentTarget<'_>, key: &str) -> SecretMount {
    SecretMount {
        secret_name: naming::secret_name(target.router_name, target.version.version),
        key: key.to_string(),
        mount_path: format!("{SECRET_MOUNT_DIR}/{key}"),
    }
}

fn fluentd_tag(target: &DeploymentTarget<'_>) -> String {
    format!("{}-{}.log", target.router_name, target.version.version)
}

fn cluster_local_url(service: &str, namespace: &str, path: &str) -> String {
    format!(
        "http://{service}.{namespace}.svc.cluster.local/{}",
        path.trim_start_matches('/')
    )
}

fn metric_name(metric: AutoscalingMetric) -> &'static str {
    match metric {
        AutoscalingMetric::Concurrency => "concurrency",
        AutoscalingMetric::Rps => "rps",
        AutoscalingMetric::Cpu => "cpu",
        AutoscalingMetric::Memory => "memory",
    }
}

fn validate_resources(
    component: &str,
    request: &ResourceRequest,
    autoscaling: &AutoscalingPolicy,
) -> DeployResult<()> {
    let invalid = |reason: String| Err(DeployError::Build(format!("{component}: {reason}")));

    if request.max_replica == 0 {
        return invalid("max replica must be at least 1".to_string());
    }
    if request.min_replica > request.max_replica {
        return invalid(format!(
            "min replica {} exceeds max replica {}",
            request.min_replica, request.max_replica
        ));
    }
    let quantities = [
        ("cpu request", Some(&request.cpu_request)),
        ("memory request", Some(&request.memory_request)),
        ("cpu limit", request.cpu_limit.as_ref()),
    ];
    for (field, value) in quantities {
        if let Some(value) = value {
            if !is_quantity(value) {
                return invalid(format!("invalid {field} {value:?}"));
            }
        }
    }
    if !autoscaling
        .target
        .parse::<f64>()
        .is_ok_and(|t| t.is_finite() && t > 0.0)
    {
        return invalid(format!("invalid autoscaling target {:?}", autoscaling.target));
    }
    Ok(())
}

/// A positive Kubernetes quantity such as "500m", "2" or "1.5Gi".
fn is_quantity(value: &str) -> bool {
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    number.parse::<f64>().is_ok_and(|n| n > 0.0) && QUANTITY_SUFFIXES.contains(&suffix)
}

#[cfg(test)]
mod tests {
    use turing_state::{
        Enricher, Ensembler, EnvVar, ExperimentConfig, LogConfig, Route, RouterVersionStatus,
    };

    use super::*;

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
            endpoint: "/enrich".to_string(),
            timeout: "60ms".to_string(),
            port: 8080,
            env: vec![EnvVar {
                name: "MODEL".to_string(),
                value: "v3".to_string(),
            }],
            service_account: None,
        }
    }

    fn version() -> RouterVersion {
        RouterVersion {
            id: 10,
            router_id: 1,
            version: 2,
            status: RouterVersionStatus::Pending,
            error: String::new(),
            image: String::new(),
            routes: vec![Route {
                id: "control".to_string(),
                endpoint: "http://control.models/predict".to_string(),
                timeout: "50ms".to_string(),
                service_method: None,
            }],
            default_route_id: Some("control".to_string()),
            rules: vec![],
            experiment_engine: ExperimentConfig::default(),
            resource_request: ResourceRequest::default(),
            autoscaling_policy: AutoscalingPolicy::default(),
            timeout: "100ms".to_string(),
            protocol: Protocol::Http,
            log_config: LogConfig::default(),
            enricher: None,
            ensembler: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn builder() -> ResourceBuilder {
        ResourceBuilder::new(&TuringConfig::default())
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

    static NO_EXPERIMENT: serde_json::Value = serde_json::Value::Null;

    #[test]
    fn router_only_version_builds_one_component() {
        let (project, version, secrets) = (project(), version(), DeploymentSecrets::default());
        let components = builder()
            .components(&target(&project, &version, &secrets))
            .unwrap();

        assert_eq!(components.len(), 1);
        let router = &components[0].service;
        assert_eq!(components[0].kind, ComponentKind::Router);
        assert_eq!(router.name, "fraud-turing-router-2");
        assert_eq!(router.namespace, "risk");
        assert_eq!(router.image, "ghcr.io/caraml-dev/turing/turing-router:latest");
        assert_eq!(router.env["APP_RESULT_LOGGER"], "nop");
        assert_eq!(router.labels["team"], "fraud-team");
        assert_eq!(
            router.config_map_mounts[0].config_map_name,
            "fraud-turing-fiber-config-2"
        );
        assert!(!router.env.contains_key("ENRICHER_ENDPOINT"));
    }

    #[test]
    fn enricher_and_docker_ensembler_are_wired_into_the_router() {
        let (project, mut version) = (project(), version());
        version.enricher = Some(Enricher {
            id: 1,
            container: container("enricher:1"),
        });
        version.ensembler = Some(Ensembler {
            id: 1,
            kind: EnsemblerKind::Docker(container("ensembler:1")),
        });
        let secrets = DeploymentSecrets {
            enricher_service_account: Some("{}".to_string()),
            ..Default::default()
        };
        let components = builder()
            .components(&target(&project, &version, &secrets))
            .unwrap();

        let kinds: Vec<_> = components.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ComponentKind::Enricher,
                ComponentKind::Ensembler,
                ComponentKind::Router
            ]
        );
        let enricher = &components[0].service;
        assert_eq!(enricher.env["MODEL"], "v3");
        assert_eq!(
            enricher.env["GOOGLE_APPLICATION_CREDENTIALS"],
            "/var/secret/enricher-service-account.json"
        );
        assert!(components[1].service.secret_mounts.is_empty());

        let router = &components[2].service;
        assert_eq!(
            router.env["ENRICHER_ENDPOINT"],
            "http://fraud-turing-enricher-2.risk.svc.cluster.local/enrich"
        );
        assert_eq!(
            router.env["ENSEMBLER_ENDPOINT"],
            "http://fraud-turing-ensembler-2.risk.svc.cluster.local/enrich"
        );
    }

    #[test]
    fn standard_ensembler_goes_into_router_config() {
        let (project, mut version, secrets) = (project(), version(), DeploymentSecrets::default());
        version.ensembler = Some(Ensembler {
            id: 1,
            kind: EnsemblerKind::Standard {
                route_name_path: "policy.route".to_string(),
                experiment_mappings: vec![],
                lazy_routing: false,
            },
        });
        let t = target(&project, &version, &secrets);

        assert_eq!(builder().components(&t).unwrap().len(), 1);
        let config_map = builder().router_config_map(&t).unwrap();
        let rendered: serde_json::Value =
            serde_json::from_str(&config_map.data["fiber.json"]).unwrap();
        assert_eq!(rendered["ensembler"]["route_name_path"], "policy.route");
        assert_eq!(rendered["routes"][0]["id"], "control");
        assert_eq!(rendered["experiment_engine"]["type"], "nop");
    }

    #[test]
    fn invalid_resource_request_is_rejected() {
        let (project, secrets) = (project(), DeploymentSecrets::default());

        let mut version = version();
        version.resource_request.min_replica = 5;
        version.resource_request.max_replica = 2;
        let err = builder()
            .components(&target(&project, &version, &secrets))
            .unwrap_err();
        assert!(err.to_string().contains("min replica 5 exceeds max replica 2"));

        let mut version = self::version();
        version.resource_request.memory_request = "lots".to_string();
        let err = builder()
            .components(&target(&project, &version, &secrets))
            .unwrap_err();
        assert!(matches!(err, DeployError::Build(_)));

        let mut version = self::version();
        version.autoscaling_policy.target = "0".to_string();
        assert!(
            builder()
                .components(&target(&project, &version, &secrets))
                .is_err()
        );
    }

    #[test]
    fn quantities() {
        for ok in ["500m", "2", "1.5Gi", "512Mi", "1k"] {
            assert!(is_quantity(ok), "{ok}");
        }
        for bad in ["", "0", "Gi", "1.5.2", "12XB", "-1"] {
            assert!(!is_quantity(bad), "{bad}");
        }
    }

    #[test]
    fn secret_holds_only_provided_keys() {
        let (project, version) = (project(), version());
        let secrets = DeploymentSecrets {
            router_service_account: Some("sa".to_string()),
            experiment_passkey: Some("pass".to_string()),
            ..Default::default()
        };
        let secret = builder().secret(&target(&project, &version, &secrets));
        assert_eq!(secret.name, "fraud-turing-secret-2");
        assert_eq!(
            secret.data.keys().collect::<Vec<_>>(),
            vec!["experiment_passkey", "router-service-account.json"]
        );
    }

    #[test]
    fn batched_logger_resources() {
        let (project, mut version) = (project(), version());
        version.log_config.result_logger = ResultLogger::BigQuery {
            table: "proj.dataset.results".to_string(),
            service_account_secret: "bq-sa".to_string(),
            batch_load: true,
        };
        let secrets = DeploymentSecrets {
            router_service_account: Some("sa".to_string()),
            ..Default::default()
        };
        let t = target(&project, &version, &secrets);
        let b = builder();

        let claim = b.fluentd_claim(&t);
        assert_eq!(claim.name, "fraud-turing-fluentd-logger-pvc-2");
        assert_eq!(claim.storage, "2Gi");

        let fluentd = b.fluentd_service(&t).unwrap();
        assert_eq!(fluentd.name, "fraud-turing-fluentd-logger-2");
        assert_eq!(
            fluentd.volume_claim.as_ref().unwrap().claim_name,
            claim.name
        );
        assert_eq!(fluentd.env["FLUENTD_BQ_TABLE"], "proj.dataset.results");

        let router = b.components(&t).unwrap().pop().unwrap().service;
        assert_eq!(
            router.env["APP_FLUENTD_HOST"],
            "fraud-turing-fluentd-logger-2.risk.svc.cluster.local"
        );
    }

    #[test]
    fn fluentd_requires_bigquery_logger() {
        let (project, version, secrets) = (project(), version(), DeploymentSecrets::default());
        assert!(
            builder()
                .fluentd_service(&target(&project, &version, &secrets))
                .is_err()
        );
    }

    #[test]
    fn virtual_service_targets_version_host() {
        let (project, version, secrets) = (project(), version(), DeploymentSecrets::default());
        let b = builder();
        let vs = b.virtual_service(
            &target(&project, &version, &secrets),
            "http://fraud-turing-router-2.risk.svc.cluster.local/",
        );
        assert_eq!(vs.name, "fraud-turing-router");
        assert_eq!(vs.hosts, vec!["fraud-turing-router.risk.models.local"]);
        assert_eq!(vs.destination_host, "fraud-turing-router-2.risk.svc.cluster.local");
        assert_eq!(
            b.endpoint("fraud", "risk"),
            "http://fraud-turing-router.risk.models.local"
        );
    }

    #[test]
    fn component_names_do_not_need_a_valid_spec() {
        let mut version = version();
        version.resource_request.max_replica = 0;
        version.enricher = Some(Enricher {
            id: 1,
            container: container("enricher:1"),
        });
        assert_eq!(
            ResourceBuilder::component_names("fraud", &version),
            vec!["fraud-turing-enricher-2", "fraud-turing-router-2"]
        );
    }
}
