//! Router version records.

use std::collections::HashSet;

use tracing::info;
use turing_state::{RouterId, RouterVersion, RouterVersionStatus, StateStore};

use crate::error::{LifecycleError, LifecycleResult};

/// Creates, reads and deletes router versions. Status changes go through
/// `RouterService`, which owns deployment.
#[derive(Clone)]
pub struct RouterVersionService {
    store: StateStore,
}

impl RouterVersionService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record a new version of a router from `spec`.
    ///
    /// The version number and the ids of the version and its children are
    /// assigned here; whatever `spec` carries for them is ignored.
    pub fn create(&self, router_id: RouterId, spec: &RouterVersion) -> LifecycleResult<RouterVersion> {
        validate_routes(spec)?;
        let mut version = spec.clone();
        version.id = 0;
        version.version = 0;
        version.router_id = router_id;
        version.status = RouterVersionStatus::Pending;
        version.error.clear();
        if let Some(enricher) = version.enricher.as_mut() {
            enricher.id = 0;
        }
        if let Some(ensembler) = version.ensembler.as_mut() {
            ensembler.id = 0;
        }

        let version = self.store.save_router_version(&version)?;
        info!(router_id, version = version.version, id = version.id, "router version created");
        Ok(version)
    }

    pub fn get(&self, router_id: RouterId, version: u32) -> LifecycleResult<RouterVersion> {
        self.store
            .find_router_version(router_id, version)?
            .ok_or_else(|| {
                LifecycleError::NotFound(format!("version {version} of router {router_id}"))
            })
    }

    pub fn list(&self, router_id: RouterId) -> LifecycleResult<Vec<RouterVersion>> {
        Ok(self.store.list_router_versions(router_id)?)
    }

    pub fn list_by_status(
        &self,
        router_id: RouterId,
        status: RouterVersionStatus,
    ) -> LifecycleResult<Vec<RouterVersion>> {
        Ok(self.store.list_router_versions_by_status(router_id, status)?)
    }

    pub fn latest(&self, router_id: RouterId) -> LifecycleResult<Option<RouterVersion>> {
        Ok(self.store.find_latest_router_version(router_id)?)
    }

    /// Delete a version with its enricher and ensembler.
    ///
    /// Refused while the version is any router's current version. Does not
    /// take the router's lock; `RouterService::delete_version` does.
    pub fn delete(&self, router_id: RouterId, version: u32) -> LifecycleResult<()> {
        let record = self.get(router_id, version)?;
        self.store.delete_router_version(record.id)?;
        info!(router_id, version, "router version deleted");
        Ok(())
    }

    /// Persist a new status and error message.
    pub(crate) fn set_status(
        &self,
        version: &RouterVersion,
        status: RouterVersionStatus,
        error: &str,
    ) -> LifecycleResult<RouterVersion> {
        let mut updated = version.clone();
        updated.status = status;
        updated.error = error.to_string();
        Ok(self.store.save_router_version(&updated)?)
    }
}

/// The default route and every rule must name routes the version defines.
pub(crate) fn validate_routes(spec: &RouterVersion) -> LifecycleResult<()> {
    let ids: HashSet<&str> = spec.routes.iter().map(|r| r.id.as_str()).collect();
    if ids.len() != spec.routes.len() {
        return Err(LifecycleError::Invalid("route ids must be unique".to_string()));
    }
    if let Some(default) = &spec.default_route_id {
        if !ids.contains(default.as_str()) {
            return Err(LifecycleError::Invalid(format!(
                "default route {default} is not defined"
            )));
        }
    }
    for rule in &spec.rules {
        if let Some(missing) = rule.routes.iter().find(|r| !ids.contains(r.as_str())) {
            return Err(LifecycleError::Invalid(format!(
                "rule {} references undefined route {missing}",
                rule.name
            )));
        }
    }
    Ok(())
}
