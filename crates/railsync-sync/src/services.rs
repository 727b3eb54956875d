use std::collections::{HashMap, HashSet};

use railsync_core::{FeedRecord, NewService, ServiceId};
use railsync_store::{ReconcileStore, StoreError};
use tracing::{info, warn};

use crate::dimensions::Dimensions;
use crate::routes::RouteIndex;
use crate::summary::EntityCounts;

/// `service_uid` → `service_id` for every service of the batch that exists
/// in the store after the service step.
#[derive(Debug, Clone, Default)]
pub struct ServiceIndex {
    by_uid: HashMap<String, ServiceId>,
}

impl ServiceIndex {
    pub fn service_for(&self, uid: &str) -> Option<ServiceId> {
        self.by_uid.get(uid).copied()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        let mut ids = self.by_uid.values().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceCounts {
    pub services: EntityCounts,
    pub route_drift: usize,
}

/// First record per `service_uid`, in input order.
pub fn dedup_services(records: &[FeedRecord]) -> Vec<&FeedRecord> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.service_uid.as_str()))
        .collect()
}

/// Insert services the store does not hold yet.
///
/// Services are never rewritten. An existing service whose incoming route
/// differs is counted as route drift and left as stored.
pub async fn sync_services(
    store: &dyn ReconcileStore,
    records: &[FeedRecord],
    dims: &Dimensions,
    routes: &RouteIndex,
) -> Result<(ServiceIndex, ServiceCounts), StoreError> {
    let mut counts = ServiceCounts::default();
    let mut candidates = Vec::new();

    for record in dedup_services(records) {
        if record.operator_name.trim().is_empty() {
            warn!(service_uid = %record.service_uid, "skipping service without operator");
            counts.services.skipped += 1;
            continue;
        }
        let Some(route_id) = routes.resolve(dims, record) else {
            warn!(service_uid = %record.service_uid, "skipping service with unresolved route");
            counts.services.skipped += 1;
            continue;
        };
        candidates.push(NewService {
            service_uid: record.service_uid.clone(),
            train_identity: record.train_identity.clone(),
            service_date: record.service_date,
            route_id,
        });
    }

    let uids = candidates
        .iter()
        .map(|c| c.service_uid.clone())
        .collect::<Vec<_>>();
    let existing = store.load_services(&uids).await?;

    let mut index = ServiceIndex::default();
    let mut stored_routes = HashMap::new();
    for row in existing {
        stored_routes.insert(row.service_uid.clone(), row.route_id);
        index.by_uid.insert(row.service_uid, row.service_id);
    }

    let mut new_services = Vec::new();
    for candidate in candidates {
        match stored_routes.get(&candidate.service_uid) {
            Some(stored) => {
                if *stored != candidate.route_id {
                    warn!(
                        service_uid = %candidate.service_uid,
                        stored_route = %stored,
                        incoming_route = %candidate.route_id,
                        "service route differs from stored route; keeping stored"
                    );
                    counts.route_drift += 1;
                }
                counts.services.unchanged += 1;
            }
            None => new_services.push(candidate),
        }
    }

    let inserted = store.insert_services(&new_services).await?;
    counts.services.inserted = inserted.len();
    for row in inserted {
        index.by_uid.insert(row.service_uid, row.service_id);
    }

    info!(
        inserted = counts.services.inserted,
        skipped = counts.services.skipped,
        route_drift = counts.route_drift,
        "services synced"
    );
    Ok((index, counts))
}
