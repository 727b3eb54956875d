use std::collections::{HashMap, HashSet};

use railsync_core::{FeedRecord, NewStop, StopFields, StopId, StopKey, StopRow, StopUpdate};
use railsync_store::{ReconcileStore, StoreError};
use tracing::{debug, info};

use crate::dimensions::Dimensions;
use crate::services::ServiceIndex;
use crate::summary::EntityCounts;

/// `(service_id, station_id)` → `stop_id` for every stop of the batch that
/// exists after the stop step.
#[derive(Debug, Clone, Default)]
pub struct StopIndex {
    by_key: HashMap<StopKey, StopId>,
}

impl StopIndex {
    pub fn stop_for(&self, key: &StopKey) -> Option<StopId> {
        self.by_key.get(key).copied()
    }
}

pub fn stop_key(record: &FeedRecord, dims: &Dimensions, services: &ServiceIndex) -> Option<StopKey> {
    Some(StopKey {
        service_id: services.service_for(&record.service_uid)?,
        station_id: dims.station_for(record)?,
    })
}

/// The batch's records grouped by stop key.
#[derive(Debug, Default)]
pub struct StopRecords<'a> {
    /// First record per key, in input order.
    pub first: Vec<(StopKey, &'a FeedRecord)>,
    /// Records whose service or station did not resolve.
    pub unresolved: Vec<&'a FeedRecord>,
    /// Later records for a key already seen.
    pub duplicates: usize,
}

pub fn first_per_stop<'a>(
    records: &'a [FeedRecord],
    dims: &Dimensions,
    services: &ServiceIndex,
) -> StopRecords<'a> {
    let mut seen = HashSet::new();
    let mut grouped = StopRecords::default();
    for record in records {
        match stop_key(record, dims, services) {
            Some(key) if seen.insert(key) => grouped.first.push((key, record)),
            Some(key) => {
                debug!(
                    service_id = %key.service_id,
                    station_id = %key.station_id,
                    "ignoring repeated record for stop"
                );
                grouped.duplicates += 1;
            }
            None => grouped.unresolved.push(record),
        }
    }
    grouped
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopCounts {
    pub stops: EntityCounts,
    /// Records dropped because an earlier record named the same stop.
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopChange {
    Insert,
    Update(StopId),
    Unchanged,
}

/// Compare on the full field tuple. Any difference in a time, the platform
/// or the platform-changed flag is an update.
pub fn classify_stop(existing: Option<&StopRow>, incoming: &StopFields) -> StopChange {
    match existing {
        None => StopChange::Insert,
        Some(row) if row.fields != *incoming => StopChange::Update(row.stop_id),
        Some(_) => StopChange::Unchanged,
    }
}

/// Insert new stops and update changed ones under a single commit.
pub async fn sync_stops(
    store: &dyn ReconcileStore,
    records: &[FeedRecord],
    dims: &Dimensions,
    services: &ServiceIndex,
) -> Result<(StopIndex, StopCounts), StoreError> {
    let mut counts = StopCounts::default();
    let grouped = first_per_stop(records, dims, services);
    for record in &grouped.unresolved {
        debug!(
            service_uid = %record.service_uid,
            station_crs = %record.station_crs,
            "skipping stop with unresolved service or station"
        );
    }
    counts.stops.skipped = grouped.unresolved.len();
    counts.duplicates = grouped.duplicates;

    let existing = store
        .load_stops(&services.ids())
        .await?
        .into_iter()
        .map(|row| (row.key, row))
        .collect::<HashMap<_, _>>();

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for (key, record) in grouped.first {
        let fields = record.stop_fields();
        match classify_stop(existing.get(&key), &fields) {
            StopChange::Insert => inserts.push(NewStop { key, fields }),
            StopChange::Update(stop_id) => updates.push(StopUpdate { stop_id, fields }),
            StopChange::Unchanged => counts.stops.unchanged += 1,
        }
    }

    let inserted = store.apply_stop_changes(&inserts, &updates).await?;
    counts.stops.inserted = inserted.len();
    counts.stops.updated = updates.len();

    let mut index = StopIndex {
        by_key: existing.iter().map(|(key, row)| (*key, row.stop_id)).collect(),
    };
    index.by_key.extend(inserted.iter().map(|row| (row.key, row.stop_id)));

    info!(
        inserted = counts.stops.inserted,
        updated = counts.stops.updated,
        unchanged = counts.stops.unchanged,
        skipped = counts.stops.skipped,
        duplicates = counts.duplicates,
        "stops synced"
    );
    Ok((index, counts))
}
