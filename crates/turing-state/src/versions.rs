//! Router versions and their enricher/ensembler children.
//!
//! A version row stores its children by id. `save_router_version` writes the
//! children first and links their generated ids before writing the version;
//! `delete_router_version` removes all three in one transaction.

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::routers::{count_referencing, write_router};
use crate::store::{
    epoch_secs, get_record, map_err, next_id, not_found, put_record, scan_records, StateStore,
};
use crate::tables::*;
use crate::types::*;

/// On-disk shape of a version: children are replaced by their ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVersion {
    enricher_id: Option<EnricherId>,
    ensembler_id: Option<EnsemblerId>,
    version: RouterVersion,
}

impl StateStore {
    /// Create a version, or persist the status of an existing one.
    ///
    /// For a new version (`id == 0`) the store assigns the id and the next
    /// version number of its router, and creates the enricher and ensembler
    /// rows. For an existing version only `status` and `error` may differ
    /// from what is stored; any other difference is a `Conflict`.
    pub fn save_router_version(&self, version: &RouterVersion) -> StateResult<RouterVersion> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let saved = if version.id == 0 {
            create_version(&txn, version)?
        } else {
            update_version(&txn, version)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            id = saved.id,
            router_id = saved.router_id,
            version = saved.version,
            status = ?saved.status,
            "router version stored"
        );
        Ok(saved)
    }

    /// Persist the outcome of a deployment: the version's status and error
    /// together with the router's pointer, status and endpoint.
    ///
    /// Both rows are written in one transaction, so either both change or
    /// neither does.
    pub fn save_deployment(
        &self,
        router: &Router,
        version: &RouterVersion,
    ) -> StateResult<(Router, RouterVersion)> {
        if version.router_id != router.id {
            return Err(StateError::Conflict(format!(
                "router version {} does not belong to router {}",
                version.id, router.id
            )));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version = update_version(&txn, version)?;
        let router = write_router(&txn, router)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            router_id = router.id,
            version = version.version,
            status = ?version.status,
            router_status = ?router.status,
            current_version = ?router.curr_router_version_id,
            "deployment outcome stored"
        );
        Ok((router, version))
    }

    pub fn get_router_version(&self, id: RouterVersionId) -> StateResult<Option<RouterVersion>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let versions = txn.open_table(ROUTER_VERSIONS).map_err(map_err!(Table))?;
        let enrichers = txn.open_table(ENRICHERS).map_err(map_err!(Table))?;
        let ensemblers = txn.open_table(ENSEMBLERS).map_err(map_err!(Table))?;
        match get_record::<StoredVersion, _>(&versions, id)? {
            Some(stored) => Ok(Some(assemble(stored, &enrichers, &ensemblers)?)),
            None => Ok(None),
        }
    }

    /// All versions of a router, ordered by version number.
    pub fn list_router_versions(&self, router_id: RouterId) -> StateResult<Vec<RouterVersion>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let versions = txn.open_table(ROUTER_VERSIONS).map_err(map_err!(Table))?;
        let enrichers = txn.open_table(ENRICHERS).map_err(map_err!(Table))?;
        let ensemblers = txn.open_table(ENSEMBLERS).map_err(map_err!(Table))?;

        let stored: Vec<StoredVersion> = scan_records(&versions)?;
        let mut results = stored
            .into_iter()
            .filter(|s| s.version.router_id == router_id)
            .map(|s| assemble(s, &enrichers, &ensemblers))
            .collect::<StateResult<Vec<_>>>()?;
        results.sort_by_key(|v| v.version);
        Ok(results)
    }

    pub fn list_router_versions_by_status(
        &self,
        router_id: RouterId,
        status: RouterVersionStatus,
    ) -> StateResult<Vec<RouterVersion>> {
        let mut versions = self.list_router_versions(router_id)?;
        versions.retain(|v| v.status == status);
        Ok(versions)
    }

    pub fn find_router_version(
        &self,
        router_id: RouterId,
        version: u32,
    ) -> StateResult<Option<RouterVersion>> {
        Ok(self
            .list_router_versions(router_id)?
            .into_iter()
            .find(|v| v.version == version))
    }

    /// The highest-numbered version of a router.
    pub fn find_latest_router_version(
        &self,
        router_id: RouterId,
    ) -> StateResult<Option<RouterVersion>> {
        Ok(self.list_router_versions(router_id)?.into_iter().last())
    }

    /// Delete a version together with its enricher and ensembler.
    ///
    /// Refused with `Conflict` while any router points at the version.
    pub fn delete_router_version(&self, id: RouterVersionId) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let routers = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
            let referencing = count_referencing(&routers, id)?;
            if referencing > 0 {
                return Err(StateError::Conflict(format!(
                    "router version {id} is the current version of {referencing} router(s) \
                     and cannot be deleted"
                )));
            }

            let mut versions = txn.open_table(ROUTER_VERSIONS).map_err(map_err!(Table))?;
            let stored: StoredVersion =
                get_record(&versions, id)?.ok_or_else(|| not_found("router version", id))?;
            versions.remove(id).map_err(map_err!(Write))?;

            if let Some(enricher_id) = stored.enricher_id {
                let mut enrichers = txn.open_table(ENRICHERS).map_err(map_err!(Table))?;
                enrichers.remove(enricher_id).map_err(map_err!(Write))?;
            }
            if let Some(ensembler_id) = stored.ensembler_id {
                let mut ensemblers = txn.open_table(ENSEMBLERS).map_err(map_err!(Table))?;
                ensemblers.remove(ensembler_id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, "router version deleted");
        Ok(())
    }
}

fn create_version(txn: &WriteTransaction, version: &RouterVersion) -> StateResult<RouterVersion> {
    {
        let routers = txn.open_table(ROUTERS).map_err(map_err!(Table))?;
        if get_record::<Router, _>(&routers, version.router_id)?.is_none() {
            return Err(not_found("router", version.router_id));
        }
    }

    let now = epoch_secs();
    let mut saved = version.clone();
    saved.id = next_id(txn, "router_versions")?;
    // A per-router counter, so a deleted latest version's number is not reissued.
    saved.version = next_id(txn, &format!("router_versions:{}", version.router_id))? as u32;
    saved.created_at = now;
    saved.updated_at = now;

    let enricher_id = match saved.enricher.as_mut() {
        Some(enricher) => {
            enricher.id = next_id(txn, "enrichers")?;
            let mut table = txn.open_table(ENRICHERS).map_err(map_err!(Table))?;
            put_record(&mut table, enricher.id, enricher)?;
            Some(enricher.id)
        }
        None => None,
    };
    let ensembler_id = match saved.ensembler.as_mut() {
        Some(ensembler) => {
            ensembler.id = next_id(txn, "ensemblers")?;
            let mut table = txn.open_table(ENSEMBLERS).map_err(map_err!(Table))?;
            put_record(&mut table, ensembler.id, ensembler)?;
            Some(ensembler.id)
        }
        None => None,
    };

    write_version(txn, &saved, enricher_id, ensembler_id)?;
    Ok(saved)
}

fn update_version(txn: &WriteTransaction, version: &RouterVersion) -> StateResult<RouterVersion> {
    let stored: StoredVersion = {
        let versions = txn.open_table(ROUTER_VERSIONS).map_err(map_err!(Table))?;
        get_record(&versions, version.id)?.ok_or_else(|| not_found("router version", version.id))?
    };
    let (enricher_id, ensembler_id) = (stored.enricher_id, stored.ensembler_id);
    let existing = {
        let enrichers = txn.open_table(ENRICHERS).map_err(map_err!(Table))?;
        let ensemblers = txn.open_table(ENSEMBLERS).map_err(map_err!(Table))?;
        assemble(stored, &enrichers, &ensemblers)?
    };

    let mut candidate = version.clone();
    candidate.status = existing.status;
    candidate.error = existing.error.clone();
    candidate.updated_at = existing.updated_at;
    if candidate != existing {
        return Err(StateError::Conflict(format!(
            "router version {} is immutable; create a new version instead",
            version.id
        )));
    }

    let mut saved = existing;
    saved.status = version.status;
    saved.error = version.error.clone();
    saved.updated_at = epoch_secs();
    write_version(txn, &saved, enricher_id, ensembler_id)?;
    Ok(saved)
}

fn write_version(
    txn: &WriteTransaction,
    version: &RouterVersion,
    enricher_id: Option<EnricherId>,
    ensembler_id: Option<EnsemblerId>,
) -> StateResult<()> {
    let mut row = version.clone();
    row.enricher = None;
    row.ensembler = None;
    let stored = StoredVersion {
        enricher_id,
        ensembler_id,
        version: row,
    };
    let mut table = txn.open_table(ROUTER_VERSIONS).map_err(map_err!(Table))?;
    put_record(&mut table, version.id, &stored)
}

fn assemble<E, S>(stored: StoredVersion, enrichers: &E, ensemblers: &S) -> StateResult<RouterVersion>
where
    E: ReadableTable<u64, &'static [u8]>,
    S: ReadableTable<u64, &'static [u8]>,
{
    let mut version = stored.version;
    if let Some(id) = stored.enricher_id {
        version.enricher = Some(get_record(enrichers, id)?.ok_or_else(|| not_found("enricher", id))?);
    }
    if let Some(id) = stored.ensembler_id {
        version.ensembler =
            Some(get_record(ensemblers, id)?.ok_or_else(|| not_found("ensembler", id))?);
    }
    Ok(version)
}
