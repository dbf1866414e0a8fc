//! Cluster resource descriptions submitted to a controller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A request-serving workload deployed as a Knative service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnativeService {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: Option<String>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Knative autoscaling class metric: "concurrency", "rps", "cpu" or "memory".
    pub autoscaling_metric: String,
    pub autoscaling_target: String,
    /// Serve gRPC (h2c) instead of HTTP/1.
    pub http2: bool,
    pub secret_mounts: Vec<SecretMount>,
    pub config_map_mounts: Vec<ConfigMapMount>,
}

/// Mounts one key of a secret as a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretMount {
    pub secret_name: String,
    pub key: String,
    pub mount_path: String,
}

/// Mounts a whole config map as a directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMapMount {
    pub config_map_name: String,
    pub mount_path: String,
}

/// A plain Kubernetes deployment plus service, for non-serving sidecars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubernetesService {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub port: u16,
    pub replicas: u32,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub volume_claim: Option<VolumeClaimMount>,
    pub secret_mounts: Vec<SecretMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeClaimMount {
    pub claim_name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMap {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistentVolumeClaim {
    pub name: String,
    pub namespace: String,
    /// Kubernetes quantity, e.g. "2Gi".
    pub storage: String,
    pub access_modes: Vec<String>,
}

/// Routes the stable router host to one version's router service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualService {
    pub name: String,
    pub namespace: String,
    pub gateway: String,
    /// Hosts clients call.
    pub hosts: Vec<String>,
    /// Host of the backing service traffic is sent to.
    pub destination_host: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: String,
}

impl Pod {
    /// True if every `key=value` pair of a comma-separated selector matches.
    pub fn matches_selector(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => self.labels.get(key).is_some_and(|v| v == value),
                None => self.labels.contains_key(term),
            })
    }
}
