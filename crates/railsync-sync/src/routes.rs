use std::collections::{HashMap, HashSet};

use railsync_core::{FeedRecord, RouteId, RouteKey, RouteRow};
use railsync_store::{ReconcileStore, StoreError};
use tracing::{info, warn};

use crate::dimensions::Dimensions;
use crate::summary::EntityCounts;

/// Every route the store holds after the route step, keyed by its id triple.
#[derive(Debug, Clone, Default)]
pub struct RouteIndex {
    routes: HashMap<RouteKey, RouteId>,
}

impl RouteIndex {
    pub fn from_rows(rows: &[RouteRow]) -> Self {
        Self {
            routes: rows.iter().map(|r| (r.key, r.route_id)).collect(),
        }
    }

    pub fn route_for(&self, key: &RouteKey) -> Option<RouteId> {
        self.routes.get(key).copied()
    }

    /// Resolve a record's route in two hops: names to ids, ids to route.
    pub fn resolve(&self, dims: &Dimensions, record: &FeedRecord) -> Option<RouteId> {
        dims.route_key(record.route_names())
            .and_then(|key| self.route_for(&key))
    }

    fn merge(&mut self, rows: &[RouteRow]) {
        self.routes.extend(rows.iter().map(|r| (r.key, r.route_id)));
    }
}

/// Resolve each distinct name triple to an id triple and insert the triples
/// the route table lacks. The diff runs on ids, never on names.
pub async fn sync_routes(
    store: &dyn ReconcileStore,
    records: &[FeedRecord],
    dims: &Dimensions,
) -> Result<(RouteIndex, EntityCounts), StoreError> {
    let mut counts = EntityCounts::default();
    let mut seen_names = HashSet::new();
    let mut seen_keys = HashSet::new();
    let mut resolved = Vec::new();

    for record in records {
        let names = record.route_names();
        if !seen_names.insert(names) {
            continue;
        }
        match dims.route_key(names) {
            Some(key) => {
                if seen_keys.insert(key) {
                    resolved.push(key);
                }
            }
            None => {
                warn!(
                    origin = names.origin,
                    destination = names.destination,
                    operator = names.operator,
                    "skipping route with unresolved station or operator"
                );
                counts.skipped += 1;
            }
        }
    }

    let mut index = RouteIndex::from_rows(&store.load_routes().await?);
    let new_routes = resolved
        .iter()
        .copied()
        .filter(|key| index.route_for(key).is_none())
        .collect::<Vec<_>>();
    counts.unchanged = resolved.len() - new_routes.len();

    let inserted = store.insert_routes(&new_routes).await?;
    counts.inserted = inserted.len();
    index.merge(&inserted);

    info!(
        inserted = counts.inserted,
        skipped = counts.skipped,
        known = index.routes.len(),
        "routes synced"
    );
    Ok((index, counts))
}
