//! Router lifecycle.
//!
//! Owns the router and router version state machines and is the only caller
//! of the deployment orchestrator. Every deploy, undeploy and delete holds
//! the router's lock for its whole duration.
//!
//! A version only becomes current after its deployment succeeded. When a
//! deployment fails the version is marked `failed` with the error, and the
//! router keeps pointing at whatever it pointed at before.

use std::sync::Arc;

use tracing::{info, warn};
use turing_core::TuringConfig;
use turing_deploy::{DeployError, DeploymentSecrets, DeploymentService, DeploymentTarget};
use turing_state::{
    Event, EventStage, Project, ProjectId, Router, RouterId, RouterStatus, RouterVersion,
    RouterVersionStatus, StateStore,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::locks::RouterLocks;
use crate::recorder::EventRecorder;
use crate::versions::{RouterVersionService, validate_routes};

/// Inputs resolved by the caller for one deployment.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub secrets: DeploymentSecrets,
    /// Experiment engine config with runtime values resolved.
    pub experiment_config: serde_json::Value,
}

pub struct RouterService {
    store: StateStore,
    versions: RouterVersionService,
    deployer: Arc<DeploymentService>,
    locks: RouterLocks,
    event_buffer: usize,
}

impl RouterService {
    pub fn new(store: StateStore, deployer: Arc<DeploymentService>, config: &TuringConfig) -> Self {
        Self {
            versions: RouterVersionService::new(store.clone()),
            store,
            deployer,
            locks: RouterLocks::new(),
            event_buffer: config.deployment.event_buffer,
        }
    }

    pub fn versions(&self) -> &RouterVersionService {
        &self.versions
    }

    pub fn locks(&self) -> &RouterLocks {
        &self.locks
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn get_router(&self, router_id: RouterId) -> LifecycleResult<Router> {
        self.store
            .get_router(router_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("router {router_id}")))
    }

    pub fn find_router(
        &self,
        project_id: ProjectId,
        environment: &str,
        name: &str,
    ) -> LifecycleResult<Option<Router>> {
        Ok(self.store.find_router_by_name(project_id, environment, name)?)
    }

    pub fn list_routers(&self, project_id: Option<ProjectId>) -> LifecycleResult<Vec<Router>> {
        Ok(self.store.list_routers(project_id)?)
    }

    /// The router's current version, if any version has gone live.
    pub fn current_version(&self, router: &Router) -> LifecycleResult<Option<RouterVersion>> {
        match router.curr_router_version_id {
            Some(id) => Ok(self.store.get_router_version(id)?),
            None => Ok(None),
        }
    }

    pub fn list_events(&self, router_id: RouterId) -> LifecycleResult<Vec<Event>> {
        Ok(self.store.list_events_for_router(router_id)?)
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Create a router with its first version and deploy it.
    ///
    /// The router exists afterwards even if the deployment failed.
    pub async fn create_router(
        &self,
        project: &Project,
        environment: &str,
        name: &str,
        spec: &RouterVersion,
        options: &DeployOptions,
    ) -> LifecycleResult<Router> {
        if !self.deployer.has_environment(environment) {
            return Err(LifecycleError::Invalid(format!(
                "unknown environment {environment}"
            )));
        }
        validate_routes(spec)?;

        let router = self
            .store
            .create_router(&Router::new(project.id, environment, name))?;
        info!(router = %router.name, id = router.id, environment, "router created");
        let version = self.versions.create(router.id, spec)?;

        self.deploy_version(project, router.id, version.version, options)
            .await?;
        self.get_router(router.id)
    }

    /// Create a new version of a router and deploy it.
    pub async fn update_router(
        &self,
        project: &Project,
        router_id: RouterId,
        spec: &RouterVersion,
        options: &DeployOptions,
    ) -> LifecycleResult<RouterVersion> {
        let version = self.versions.create(router_id, spec)?;
        self.deploy_version(project, router_id, version.version, options)
            .await
    }

    /// Deploy an existing version and make it current.
    ///
    /// Also used to roll back to an older version. On success the
    /// previously current version is undeployed.
    pub async fn deploy_version(
        &self,
        project: &Project,
        router_id: RouterId,
        version: u32,
        options: &DeployOptions,
    ) -> LifecycleResult<RouterVersion> {
        let _guard = self.locks.lock(router_id).await;
        let mut router = self.get_router(router_id)?;
        check_project(project, &router)?;

        let candidate = self.versions.get(router_id, version)?;
        if router.curr_router_version_id == Some(candidate.id)
            && candidate.status == RouterVersionStatus::Deployed
        {
            return Err(LifecycleError::Conflict(format!(
                "version {version} of router {} is already deployed",
                router.name
            )));
        }
        let previous = match router.curr_router_version_id {
            Some(id) if id != candidate.id => self
                .store
                .get_router_version(id)?
                .filter(|v| v.status == RouterVersionStatus::Deployed),
            _ => None,
        };
        let candidate = self
            .versions
            .set_status(&candidate, RouterVersionStatus::Pending, "")?;

        let recorder = EventRecorder::open(self.event_buffer);
        let target = DeploymentTarget {
            project,
            environment: &router.environment_name,
            router_name: &router.name,
            version: &candidate,
            secrets: &options.secrets,
            experiment_config: &options.experiment_config,
        };
        let result = self
            .deployer
            .deploy_router_version(&target, recorder.writer())
            .await;

        // The recorder is finished on every path so the log is persisted
        // even when storing the outcome fails.
        match result {
            Ok(endpoint) => {
                let mut deployed = candidate.clone();
                deployed.status = RouterVersionStatus::Deployed;
                deployed.error = String::new();
                router.curr_router_version_id = Some(deployed.id);
                router.status = RouterStatus::Deployed;
                router.endpoint = Some(endpoint);
                let saved = self.store.save_deployment(&router, &deployed);
                if let Err(e) = &saved {
                    recorder.writer().error(
                        EventStage::DeploymentFailed,
                        format!("Version {version} is live but could not be recorded: {e}"),
                    );
                }
                recorder.finish(&self.store, router.id, version).await;
                let (router, deployed) = saved?;
                info!(router = %router.name, version, "router version is current");

                if let Some(previous) = previous {
                    self.undeploy_previous(project, &router, &previous).await;
                }
                Ok(deployed)
            }
            Err(e) => {
                let message = e.to_string();
                let mut failed = candidate.clone();
                failed.status = RouterVersionStatus::Failed;
                failed.error = message.clone();
                let kept = match &previous {
                    Some(previous) => format!("router remains on version {}", previous.version),
                    None if router.curr_router_version_id.is_some() => {
                        "router keeps its current version".to_string()
                    }
                    None => "router has no deployed version".to_string(),
                };
                recorder
                    .writer()
                    .error(EventStage::Rollback, format!("Version {version} failed; {kept}"));
                if router.curr_router_version_id.is_none() {
                    router.status = RouterStatus::Failed;
                }
                let saved = self.store.save_deployment(&router, &failed);
                recorder.finish(&self.store, router.id, version).await;
                saved?;
                warn!(router = %router.name, version, error = %message, "router version failed; pointer unchanged");
                Err(LifecycleError::DeployFailed {
                    version_id: candidate.id,
                    source: e,
                })
            }
        }
    }

    /// Tear down the version traffic moved away from. Failures are logged
    /// and recorded on the version; they do not affect the new version.
    async fn undeploy_previous(&self, project: &Project, router: &Router, previous: &RouterVersion) {
        let recorder = EventRecorder::open(self.event_buffer);
        recorder.writer().info(
            EventStage::UndeployingPreviousVersion,
            format!("Undeploying version {}", previous.version),
        );
        let (secrets, experiment_config) = (DeploymentSecrets::default(), serde_json::Value::Null);
        let target = DeploymentTarget {
            project,
            environment: &router.environment_name,
            router_name: &router.name,
            version: previous,
            secrets: &secrets,
            experiment_config: &experiment_config,
        };
        let error = match self
            .deployer
            .undeploy_router_version(&target, recorder.writer())
            .await
        {
            Ok(()) => String::new(),
            Err(e) => {
                warn!(router = %router.name, version = previous.version, error = %e, "previous version left resources behind");
                format!("leftover resources: {e}")
            }
        };
        if let Err(e) = self
            .versions
            .set_status(previous, RouterVersionStatus::Undeployed, &error)
        {
            warn!(router = %router.name, version = previous.version, error = %e, "failed to mark previous version undeployed");
        }
        recorder
            .finish(&self.store, router.id, previous.version)
            .await;
    }

    /// Take a deployed router offline: delete its current version's
    /// resources, then its routing rule.
    pub async fn undeploy_router(
        &self,
        project: &Project,
        router_id: RouterId,
    ) -> LifecycleResult<Router> {
        let _guard = self.locks.lock(router_id).await;
        let mut router = self.get_router(router_id)?;
        check_project(project, &router)?;
        if router.status != RouterStatus::Deployed {
            return Err(LifecycleError::Conflict(format!(
                "router {} is not deployed",
                router.name
            )));
        }
        let current = self.current_version(&router)?.ok_or_else(|| {
            LifecycleError::Conflict(format!("router {} has no current version", router.name))
        })?;

        let recorder = EventRecorder::open(self.event_buffer);
        let (secrets, experiment_config) = (DeploymentSecrets::default(), serde_json::Value::Null);
        let target = DeploymentTarget {
            project,
            environment: &router.environment_name,
            router_name: &router.name,
            version: &current,
            secrets: &secrets,
            experiment_config: &experiment_config,
        };
        let services = self
            .deployer
            .undeploy_router_version(&target, recorder.writer())
            .await;
        let endpoint = self
            .deployer
            .delete_router_endpoint(
                project,
                &router.environment_name,
                &router.name,
                recorder.writer(),
            )
            .await;

        let mut failures = Vec::new();
        for result in [services, endpoint] {
            match result {
                Ok(()) => {}
                Err(DeployError::Undeploy(messages)) => failures.extend(messages),
                Err(e) => failures.push(e.to_string()),
            }
        }

        let outcome = if failures.is_empty() {
            let mut undeployed = current.clone();
            undeployed.status = RouterVersionStatus::Undeployed;
            undeployed.error = String::new();
            router.status = RouterStatus::Undeployed;
            router.endpoint = None;
            Ok(undeployed)
        } else {
            let e = DeployError::Undeploy(failures);
            recorder
                .writer()
                .error(EventStage::UndeploymentFailed, e.to_string());
            router.status = RouterStatus::Failed;
            Err(e)
        };
        let saved = match &outcome {
            Ok(undeployed) => self
                .store
                .save_deployment(&router, undeployed)
                .map(|(router, _)| router),
            Err(_) => self.store.save_router(&router),
        };
        recorder.finish(&self.store, router.id, current.version).await;
        let router = saved?;
        match outcome {
            Ok(_) => {
                info!(router = %router.name, "router undeployed");
                Ok(router)
            }
            Err(e) => {
                warn!(router = %router.name, error = %e, "router undeploy left resources behind");
                Err(LifecycleError::Deploy(e))
            }
        }
    }

    /// Delete a version of a router. Refused while it is the current version.
    pub async fn delete_version(&self, router_id: RouterId, version: u32) -> LifecycleResult<()> {
        let _guard = self.locks.lock(router_id).await;
        self.versions.delete(router_id, version)
    }

    /// Delete a router with all its versions and events.
    ///
    /// Refused while the router is deployed.
    pub async fn delete_router(
        &self,
        project: &Project,
        router_id: RouterId,
    ) -> LifecycleResult<()> {
        let guard = self.locks.lock(router_id).await;
        let mut router = self.get_router(router_id)?;
        check_project(project, &router)?;
        if router.status == RouterStatus::Deployed {
            return Err(LifecycleError::Conflict(format!(
                "router {} is deployed; undeploy it before deleting",
                router.name
            )));
        }

        if router.curr_router_version_id.take().is_some() {
            self.store.save_router(&router)?;
        }
        let versions = self.versions.list(router_id)?;
        for version in &versions {
            self.store.delete_router_version(version.id)?;
        }
        let events = self.store.delete_events_for_router(router_id)?;
        self.store.delete_router(router_id)?;
        drop(guard);
        self.locks.forget(router_id);

        info!(router = %router.name, versions = versions.len(), events, "router deleted");
        Ok(())
    }
}

fn check_project(project: &Project, router: &Router) -> LifecycleResult<()> {
    if router.project_id != project.id {
        return Err(LifecycleError::Invalid(format!(
            "router {} does not belong to project {}",
            router.name, project.name
        )));
    }
    Ok(())
}
