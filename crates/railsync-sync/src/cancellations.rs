use std::collections::HashSet;

use railsync_core::{FeedRecord, NewCancellation, StopId};
use railsync_store::{ReconcileStore, StoreError};
use tracing::{debug, info};

use crate::dimensions::Dimensions;
use crate::services::ServiceIndex;
use crate::stops::{first_per_stop, StopIndex};
use crate::summary::EntityCounts;

/// `(stop_id, reason)` facts for the batch, in input order, plus the number
/// of cancelled records whose stop could not be found.
///
/// Only the first record per stop is read, the same record the stop step
/// took its fields from.
pub fn cancellation_facts(
    records: &[FeedRecord],
    dims: &Dimensions,
    services: &ServiceIndex,
    stops: &StopIndex,
) -> (Vec<NewCancellation>, usize) {
    let grouped = first_per_stop(records, dims, services);
    let mut skipped = grouped.unresolved.iter().filter(|r| r.cancelled).count();
    let mut facts = Vec::new();
    for (key, record) in grouped.first.into_iter().filter(|(_, r)| r.cancelled) {
        let Some(stop_id) = stops.stop_for(&key) else {
            debug!(
                service_uid = %record.service_uid,
                station_crs = %record.station_crs,
                "skipping cancellation for unknown stop"
            );
            skipped += 1;
            continue;
        };
        facts.push(NewCancellation {
            stop_id,
            reason: record.cancel_reason.clone(),
        });
    }
    (facts, skipped)
}

/// Append cancellation facts the store does not hold yet.
///
/// Matching is exact on `(stop_id, reason)`: a stop reported again with a
/// different reason gains a second row and the first is kept.
pub async fn sync_cancellations(
    store: &dyn ReconcileStore,
    records: &[FeedRecord],
    dims: &Dimensions,
    services: &ServiceIndex,
    stops: &StopIndex,
) -> Result<EntityCounts, StoreError> {
    let mut counts = EntityCounts::default();
    let (incoming, skipped) = cancellation_facts(records, dims, services, stops);
    counts.skipped = skipped;

    let stop_ids = incoming
        .iter()
        .map(|f| f.stop_id)
        .collect::<HashSet<StopId>>()
        .into_iter()
        .collect::<Vec<_>>();
    let existing = store
        .load_cancellations(&stop_ids)
        .await?
        .iter()
        .map(|row| row.fact())
        .collect::<HashSet<_>>();

    let observed = incoming.len();
    let new_facts = incoming
        .into_iter()
        .filter(|fact| !existing.contains(fact))
        .collect::<Vec<_>>();
    counts.unchanged = observed - new_facts.len();
    let inserted = store.insert_cancellations(&new_facts).await?;
    counts.inserted = inserted.len();

    info!(
        inserted = counts.inserted,
        skipped = counts.skipped,
        "cancellations synced"
    );
    Ok(counts)
}
