//! The cluster capability interface.

use async_trait::async_trait;

use crate::error::ClusterResult;
use crate::resources::*;

/// Everything the control plane can ask of one cluster.
///
/// Calls resolve once the cluster has acted on them: `deploy_*` resolves
/// when the service is ready or has failed to become ready. Dropping a
/// returned future abandons the call, which is how deadlines cancel
/// in-flight work.
#[async_trait]
pub trait ClusterController: Send + Sync {
    /// Fails with `AlreadyExists` if the namespace is present.
    async fn create_namespace(&self, name: &str) -> ClusterResult<()>;

    /// Creates the secret or replaces its data.
    async fn create_secret(&self, secret: &Secret) -> ClusterResult<()>;

    async fn delete_secret(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn apply_config_map(&self, config_map: &ConfigMap) -> ClusterResult<()>;

    async fn delete_config_map(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn apply_persistent_volume_claim(&self, pvc: &PersistentVolumeClaim)
        -> ClusterResult<()>;

    async fn delete_persistent_volume_claim(&self, name: &str, namespace: &str)
        -> ClusterResult<()>;

    /// Create or update a Knative service and wait for it to become ready.
    async fn deploy_knative_service(&self, service: &KnativeService) -> ClusterResult<()>;

    async fn delete_knative_service(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    /// The cluster-local URL a ready Knative service serves on.
    async fn get_knative_service_url(&self, name: &str, namespace: &str) -> ClusterResult<String>;

    /// Create or update a Kubernetes deployment and service and wait for rollout.
    async fn deploy_kubernetes_service(&self, service: &KubernetesService) -> ClusterResult<()>;

    async fn delete_kubernetes_service(&self, name: &str, namespace: &str) -> ClusterResult<()>;

    async fn apply_istio_virtual_service(&self, virtual_service: &VirtualService)
        -> ClusterResult<()>;

    async fn delete_istio_virtual_service(&self, name: &str, namespace: &str)
        -> ClusterResult<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>>;

    /// Log lines of one container of a pod, oldest first.
    async fn list_pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
    ) -> ClusterResult<Vec<String>>;
}
