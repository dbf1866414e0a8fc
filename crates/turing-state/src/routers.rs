//! Router records and the name index.

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{epoch_secs, get_record, map_err, next_id, not_found, put_record, StateStore};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Insert a new router and assign its id.
    ///
    /// Fails with `Conflict` if the project already has a router of that
    /// name in the environment.
    pub fn create_router(&self, router: &Router) -> StateResult<Router> {
        let mut router = router.clone();
        let key = router.name_key();
        let now = epoch_secs();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let names = txn.open_table(ROUTER_NAMES).map_err(map_err!(Table))?;
            if names.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "router {} already exists in environment {}",
                    router.name, router.environment_name
                )));
            }
        }
        router.id = next_id(&txn, "routers")?;
        router.created_at = now;
        router.updated_at = now;
        {
            let mut names = txn.open_table(ROUTER_NAMES).map_err(map_err!(Table))?;
            names
                .insert(key.as_str(), router.id)
                .map_err(map_err!(Write))?;
            let mut table = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
            put_record(&mut table, router.id, &router)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = router.id, %key, "router created");
        Ok(router)
    }

    /// Overwrite an existing router's mutable fields.
    ///
    /// The status, endpoint and current-version pointer are written in one
    /// transaction, so readers never see a pointer without its status.
    pub fn save_router(&self, router: &Router) -> StateResult<Router> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let router = write_router(&txn, router)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            id = router.id,
            status = ?router.status,
            current_version = ?router.curr_router_version_id,
            "router stored"
        );
        Ok(router)
    }

    pub fn get_router(&self, id: RouterId) -> StateResult<Option<Router>> {
        self.read_record(ROUTERS, id)
    }

    /// Look up a router by its unique project/environment/name triple.
    pub fn find_router_by_name(
        &self,
        project_id: ProjectId,
        environment: &str,
        name: &str,
    ) -> StateResult<Option<Router>> {
        let key = name_key(project_id, environment, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(ROUTER_NAMES).map_err(map_err!(Table))?;
        let id = match names.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };
        let table = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    /// List routers, optionally restricted to one project.
    pub fn list_routers(&self, project_id: Option<ProjectId>) -> StateResult<Vec<Router>> {
        let routers: Vec<Router> = self.read_all(ROUTERS)?;
        Ok(routers
            .into_iter()
            .filter(|r| project_id.is_none_or(|p| r.project_id == p))
            .collect())
    }

    /// Delete a router and its name index entry. Returns true if it existed.
    ///
    /// Versions and events are not touched; callers remove them first.
    pub fn delete_router(&self, id: RouterId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
            let existing: Option<Router> = get_record(&table, id)?;
            existed = existing.is_some();
            if let Some(router) = existing {
                table.remove(id).map_err(map_err!(Write))?;
                let mut names = txn.open_table(ROUTER_NAMES).map_err(map_err!(Table))?;
                names
                    .remove(router.name_key().as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, existed, "router deleted");
        Ok(existed)
    }

    /// Number of routers whose current version is `version_id`.
    pub fn count_routers_by_current_version_id(
        &self,
        version_id: RouterVersionId,
    ) -> StateResult<u32> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
        count_referencing(&table, version_id)
    }
}

/// Shared by the read path and the version-deletion guard.
/// Overwrite a stored router inside `txn`, refusing renames.
pub(crate) fn write_router(txn: &WriteTransaction, router: &Router) -> StateResult<Router> {
    let mut router = router.clone();
    let mut table = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
    let existing: Router =
        get_record(&table, router.id)?.ok_or_else(|| not_found("router", router.id))?;
    if existing.name_key() != router.name_key() {
        return Err(StateError::Conflict(format!(
            "router {} cannot be renamed or moved",
            router.id
        )));
    }
    router.created_at = existing.created_at;
    router.updated_at = epoch_secs();
    put_record(&mut table, router.id, &router)?;
    Ok(router)
}

pub(crate) fn count_referencing<R>(table: &R, version_id: RouterVersionId) -> StateResult<u32>
where
    R: ReadableTable<u64, &'static [u8]>,
{
    let routers: Vec<Router> = crate::store::scan_records(table)?;
    Ok(routers
        .iter()
        .filter(|r| r.curr_router_version_id == Some(version_id))
        .count() as u32)
}
