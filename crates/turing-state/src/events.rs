//! Append-only deployment event log.

use crate::error::StateResult;
use crate::store::{epoch_secs, map_err, next_id, put_record, scan_records, StateStore};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Append an event and return it with its id assigned.
    pub fn append_event(&self, event: &Event) -> StateResult<Event> {
        let mut event = event.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        event.id = next_id(&txn, "events")?;
        if event.created_at == 0 {
            event.created_at = epoch_secs();
        }
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            put_record(&mut table, event.id, &event)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(event)
    }

    /// Events of a router in the order they were appended.
    pub fn list_events_for_router(&self, router_id: RouterId) -> StateResult<Vec<Event>> {
        let events: Vec<Event> = self.read_all(EVENTS)?;
        Ok(events
            .into_iter()
            .filter(|e| e.router_id == router_id)
            .collect())
    }

    /// Delete all events of a router. Returns number deleted.
    pub fn delete_events_for_router(&self, router_id: RouterId) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let ids: Vec<EventId> = scan_records::<Event, _>(&table)?
                .into_iter()
                .filter(|e| e.router_id == router_id)
                .map(|e| e.id)
                .collect();
            count = ids.len() as u32;
            for id in ids {
                table.remove(id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}
