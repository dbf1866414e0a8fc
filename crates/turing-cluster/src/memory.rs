//! In-memory cluster controller with operation tracing.
//!
//! Keeps every applied resource in memory and records each call that took
//! effect, so tests can assert on what reached the cluster. Latency and
//! failures can be injected per resource-name prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::ClusterController;
use crate::error::{ClusterError, ClusterResult};
use crate::resources::*;

/// A call that took effect on the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    CreateNamespace(String),
    CreateSecret(String),
    DeleteSecret(String),
    ApplyConfigMap(String),
    DeleteConfigMap(String),
    ApplyPersistentVolumeClaim(String),
    DeletePersistentVolumeClaim(String),
    DeployKnativeService(String),
    DeleteKnativeService(String),
    DeployKubernetesService(String),
    DeleteKubernetesService(String),
    ApplyVirtualService(String),
    DeleteVirtualService(String),
}

type Key = (String, String);

#[derive(Debug, Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    knative_services: BTreeMap<Key, KnativeService>,
    kubernetes_services: BTreeMap<Key, KubernetesService>,
    virtual_services: BTreeMap<Key, VirtualService>,
    pod_logs: BTreeMap<Key, Vec<String>>,
}

/// Cluster controller backed by in-process maps.
///
/// Clones share state, so a test can keep one handle while the
/// orchestrator owns another.
#[derive(Debug, Clone)]
pub struct InMemoryController {
    domain: String,
    state: Arc<Mutex<ClusterState>>,
    operations: Arc<Mutex<Vec<ClusterOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    url_fail_prefixes: Arc<Mutex<Vec<String>>>,
    latencies: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl Default for InMemoryController {
    fn default() -> Self {
        Self::new("svc.cluster.local")
    }
}

impl InMemoryController {
    /// Knative URLs are `http://{name}.{namespace}.{domain}`.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            state: Arc::default(),
            operations: Arc::default(),
            fail_prefixes: Arc::default(),
            url_fail_prefixes: Arc::default(),
            latencies: Arc::default(),
        }
    }

    /// Make every call on a resource whose name starts with `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        lock(&self.fail_prefixes).push(prefix.into());
    }

    /// Make only URL lookups of Knative services whose name starts with
    /// `prefix` fail. Deploys and deletes of those services still succeed.
    pub fn fail_url_lookup(&self, prefix: impl Into<String>) {
        lock(&self.url_fail_prefixes).push(prefix.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.fail_prefixes).clear();
        lock(&self.url_fail_prefixes).clear();
    }

    /// Delay every call on a resource whose name starts with `prefix`.
    /// The first matching prefix wins.
    pub fn set_latency(&self, prefix: impl Into<String>, latency: Duration) {
        lock(&self.latencies).push((prefix.into(), latency));
    }

    /// Returns all calls that took effect, in completion order.
    pub fn operations(&self) -> Vec<ClusterOp> {
        lock(&self.operations).clone()
    }

    pub fn clear_operations(&self) {
        lock(&self.operations).clear();
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains(name)
    }

    pub fn secret(&self, name: &str, namespace: &str) -> Option<Secret> {
        lock(&self.state).secrets.get(&key(name, namespace)).cloned()
    }

    pub fn persistent_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Option<PersistentVolumeClaim> {
        lock(&self.state).pvcs.get(&key(name, namespace)).cloned()
    }

    pub fn knative_service(&self, name: &str, namespace: &str) -> Option<KnativeService> {
        lock(&self.state)
            .knative_services
            .get(&key(name, namespace))
            .cloned()
    }

    pub fn kubernetes_service(&self, name: &str, namespace: &str) -> Option<KubernetesService> {
        lock(&self.state)
            .kubernetes_services
            .get(&key(name, namespace))
            .cloned()
    }

    pub fn virtual_service(&self, name: &str, namespace: &str) -> Option<VirtualService> {
        lock(&self.state)
            .virtual_services
            .get(&key(name, namespace))
            .cloned()
    }

    /// Names of all Knative services in a namespace.
    pub fn knative_service_names(&self, namespace: &str) -> Vec<String> {
        lock(&self.state)
            .knative_services
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn push_pod_logs(&self, namespace: &str, pod: &str, lines: &[&str]) {
        lock(&self.state)
            .pod_logs
            .entry(key(pod, namespace))
            .or_default()
            .extend(lines.iter().map(|l| l.to_string()));
    }

    /// Wait out the injected latency, then fail if the name is marked.
    async fn act(&self, name: &str) -> ClusterResult<()> {
        let latency = lock(&self.latencies)
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, latency)| *latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failing = lock(&self.fail_prefixes)
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()));
        if failing {
            debug!(%name, "injected cluster failure");
            return Err(ClusterError::Api(format!("injected failure for {name}")));
        }
        Ok(())
    }

    fn record(&self, op: ClusterOp) {
        lock(&self.operations).push(op);
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        lock(&self.state)
    }
}

#[async_trait]
impl ClusterController for InMemoryController {
    async fn create_namespace(&self, name: &str) -> ClusterResult<()> {
        self.act(name).await?;
        if !self.state().namespaces.insert(name.to_string()) {
            return Err(ClusterError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
                namespace: name.to_string(),
            });
        }
        self.record(ClusterOp::CreateNamespace(name.to_string()));
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<()> {
        self.act(&secret.name).await?;
        self.state()
            .secrets
            .insert(key(&secret.name, &secret.namespace), secret.clone());
        self.record(ClusterOp::CreateSecret(secret.name.clone()));
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.act(name).await?;
        remove(&mut self.state().secrets, "secret", name, namespace)?;
        self.record(ClusterOp::DeleteSecret(name.to_string()));
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> ClusterResult<()> {
        self.act(&config_map.name).await?;
        self.state().config_maps.insert(
            key(&config_map.name, &config_map.namespace),
            config_map.clone(),
        );
        self.record(ClusterOp::ApplyConfigMap(config_map.name.clone()));
        Ok(())
    }

    async fn delete_config_map(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.act(name).await?;
        remove(&mut self.state().config_maps, "config map", name, namespace)?;
        self.record(ClusterOp::DeleteConfigMap(name.to_string()));
        Ok(())
    }

    async fn apply_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> ClusterResult<()> {
        self.act(&pvc.name).await?;
        self.state()
            .pvcs
            .insert(key(&pvc.name, &pvc.namespace), pvc.clone());
        self.record(ClusterOp::ApplyPersistentVolumeClaim(pvc.name.clone()));
        Ok(())
    }

    async fn delete_persistent_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> ClusterResult<()> {
        self.act(name).await?;
        remove(&mut self.state().pvcs, "persistent volume claim", name, namespace)?;
        self.record(ClusterOp::DeletePersistentVolumeClaim(name.to_string()));
        Ok(())
    }

    async fn deploy_knative_service(&self, service: &KnativeService) -> ClusterResult<()> {
        self.act(&service.name).await?;
        if !self.state().namespaces.contains(&service.namespace) {
            return Err(ClusterError::NotReady {
                kind: "knative service",
                name: service.name.clone(),
                reason: format!("namespace {} does not exist", service.namespace),
            });
        }
        for mount in &service.config_map_mounts {
            if !self
                .state()
                .config_maps
                .contains_key(&key(&mount.config_map_name, &service.namespace))
            {
                return Err(ClusterError::NotReady {
                    kind: "knative service",
                    name: service.name.clone(),
                    reason: format!("config map {} not found", mount.config_map_name),
                });
            }
        }
        self.state()
            .knative_services
            .insert(key(&service.name, &service.namespace), service.clone());
        self.record(ClusterOp::DeployKnativeService(service.name.clone()));
        Ok(())
    }

    async fn delete_knative_service(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.act(name).await?;
        remove(&mut self.state().knative_services, "knative service", name, namespace)?;
        self.record(ClusterOp::DeleteKnativeService(name.to_string()));
        Ok(())
    }

    async fn get_knative_service_url(&self, name: &str, namespace: &str) -> ClusterResult<String> {
        self.act(name).await?;
        let failing = lock(&self.url_fail_prefixes)
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()));
        if failing {
            debug!(%name, "injected url lookup failure");
            return Err(ClusterError::Api(format!("injected failure for {name} url")));
        }
        if !self
            .state()
            .knative_services
            .contains_key(&key(name, namespace))
        {
            return Err(not_found("knative service", name, namespace));
        }
        Ok(format!("http://{name}.{namespace}.{}", self.domain))
    }

    async fn deploy_kubernetes_service(&self, service: &KubernetesService) -> ClusterResult<()> {
        self.act(&service.name).await?;
        if let Some(claim) = &service.volume_claim {
            if !self
                .state()
                .pvcs
                .contains_key(&key(&claim.claim_name, &service.namespace))
            {
                return Err(ClusterError::NotReady {
                    kind: "kubernetes service",
                    name: service.name.clone(),
                    reason: format!("persistent volume claim {} not bound", claim.claim_name),
                });
            }
        }
        self.state()
            .kubernetes_services
            .insert(key(&service.name, &service.namespace), service.clone());
        self.record(ClusterOp::DeployKubernetesService(service.name.clone()));
        Ok(())
    }

    async fn delete_kubernetes_service(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.act(name).await?;
        remove(
            &mut self.state().kubernetes_services,
            "kubernetes service",
            name,
            namespace,
        )?;
        self.record(ClusterOp::DeleteKubernetesService(name.to_string()));
        Ok(())
    }

    async fn apply_istio_virtual_service(
        &self,
        virtual_service: &VirtualService,
    ) -> ClusterResult<()> {
        self.act(&virtual_service.name).await?;
        self.state().virtual_services.insert(
            key(&virtual_service.name, &virtual_service.namespace),
            virtual_service.clone(),
        );
        self.record(ClusterOp::ApplyVirtualService(virtual_service.name.clone()));
        Ok(())
    }

    async fn delete_istio_virtual_service(
        &self,
        name: &str,
        namespace: &str,
    ) -> ClusterResult<()> {
        self.act(name).await?;
        remove(&mut self.state().virtual_services, "virtual service", name, namespace)?;
        self.record(ClusterOp::DeleteVirtualService(name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let state = self.state();
        let knative = state
            .knative_services
            .values()
            .map(|s| (&s.name, &s.namespace, &s.labels));
        let kubernetes = state
            .kubernetes_services
            .values()
            .map(|s| (&s.name, &s.namespace, &s.labels));
        Ok(knative
            .chain(kubernetes)
            .filter(|(_, ns, _)| ns.as_str() == namespace)
            .map(|(name, ns, labels)| Pod {
                name: format!("{name}-0"),
                namespace: ns.clone(),
                labels: labels.clone(),
                phase: "Running".to_string(),
            })
            .filter(|pod| pod.matches_selector(label_selector))
            .collect())
    }

    async fn list_pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        _container: &str,
    ) -> ClusterResult<Vec<String>> {
        self.state()
            .pod_logs
            .get(&key(pod_name, namespace))
            .cloned()
            .ok_or_else(|| not_found("pod", pod_name, namespace))
    }
}

fn key(name: &str, namespace: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(kind: &'static str, name: &str, namespace: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

fn remove<V>(
    map: &mut BTreeMap<Key, V>,
    kind: &'static str,
    name: &str,
    namespace: &str,
) -> ClusterResult<V> {
    map.remove(&key(name, namespace))
        .ok_or_else(|| not_found(kind, name, namespace))
}

/// A poisoned lock only means another test thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
