use std::collections::{HashMap, HashSet};

use railsync_core::{FeedRecord, NewStation, RouteKey, RouteNames, StationCrsUpdate, StationId};
use railsync_store::{ReconcileStore, StoreError};
use tracing::{debug, info};

use crate::cache::LookupCache;
use crate::summary::EntityCounts;

/// Output of the dimension step: a cache that covers every station and
/// operator the batch names, as far as the store knows them.
#[derive(Debug, Clone)]
pub struct Dimensions {
    cache: LookupCache,
}

impl Dimensions {
    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// Resolve a route triple by station display name and operator name.
    pub fn route_key(&self, names: RouteNames<'_>) -> Option<RouteKey> {
        Some(RouteKey {
            origin_station_id: self.cache.station_by_name(names.origin.trim())?,
            destination_station_id: self.cache.station_by_name(names.destination.trim())?,
            operator_id: self.cache.operator(names.operator.trim())?,
        })
    }

    pub fn station_for(&self, record: &FeedRecord) -> Option<StationId> {
        self.cache.station_by_crs(record.station_crs.trim())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionCounts {
    pub stations: EntityCounts,
    pub operators: EntityCounts,
}

/// Distinct visited `(crs, name)` pairs in input order. A CRS code seen
/// under a second name keeps the first.
pub fn project_stations(records: &[FeedRecord]) -> (Vec<NewStation>, usize) {
    let mut first_name: HashMap<&str, &str> = HashMap::new();
    let mut stations = Vec::new();
    let mut skipped = 0;
    for record in records {
        let crs = record.station_crs.trim();
        let name = record.station_name.trim();
        if crs.is_empty() || name.is_empty() {
            skipped += 1;
            continue;
        }
        match first_name.get(crs) {
            Some(kept) if *kept != name => {
                debug!(crs, kept, ignored = name, "station seen under a second name");
            }
            Some(_) => {}
            None => {
                first_name.insert(crs, name);
                stations.push(NewStation::visited(crs, name));
            }
        }
    }
    (stations, skipped)
}

/// Distinct non-blank origin and destination names in input order.
pub fn project_endpoints(records: &[FeedRecord]) -> Vec<&str> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|r| [r.origin_name.trim(), r.destination_name.trim()])
        .filter(|name| !name.is_empty() && seen.insert(*name))
        .collect()
}

/// Distinct non-blank operator names in input order.
pub fn project_operators(records: &[FeedRecord]) -> (Vec<String>, usize) {
    let mut seen = HashSet::new();
    let mut operators = Vec::new();
    let mut skipped = 0;
    for record in records {
        let name = record.operator_name.trim();
        if name.is_empty() {
            skipped += 1;
            continue;
        }
        if seen.insert(name) {
            operators.push(name.to_string());
        }
    }
    (operators, skipped)
}

/// Insert stations and operators the cache does not know yet.
///
/// Route origins and destinations that match no known station name become
/// stations without a CRS code. A later visit under the same name gives that
/// row its CRS code instead of inserting a second station. Each table gets at
/// most one batched statement per kind, committed before this returns.
pub async fn sync_dimensions(
    store: &dyn ReconcileStore,
    records: &[FeedRecord],
    mut cache: LookupCache,
) -> Result<(Dimensions, DimensionCounts), StoreError> {
    let mut counts = DimensionCounts::default();

    let (visited, skipped) = project_stations(records);
    counts.stations.skipped = skipped;
    let mut claims = Vec::new();
    let mut claimed_names = HashSet::new();
    let mut new_stations = Vec::new();
    for station in visited {
        let Some(crs) = station.crs_code.as_deref() else {
            continue;
        };
        if cache.station_by_crs(crs).is_some() {
            counts.stations.unchanged += 1;
            continue;
        }
        match cache.endpoint_by_name(&station.name) {
            Some(station_id) if claimed_names.insert(station.name.clone()) => {
                claims.push(StationCrsUpdate {
                    station_id,
                    crs_code: crs.to_string(),
                });
            }
            _ => new_stations.push(station),
        }
    }

    let visited_names = new_stations
        .iter()
        .map(|s| s.name.clone())
        .collect::<HashSet<_>>();
    for name in project_endpoints(records) {
        if cache.station_by_name(name).is_none() && !visited_names.contains(name) {
            new_stations.push(NewStation::endpoint(name));
        }
    }

    let claimed = store.assign_station_crs(&claims).await?;
    counts.stations.updated = claimed.len();
    cache.merge_stations(&claimed);

    let inserted = store.insert_stations(&new_stations).await?;
    counts.stations.inserted = inserted.len();
    cache.merge_stations(&inserted);

    let (operators, skipped) = project_operators(records);
    let (known, new_operators): (Vec<_>, Vec<_>) = operators
        .into_iter()
        .partition(|name| cache.operator(name).is_some());
    counts.operators.unchanged = known.len();
    counts.operators.skipped = skipped;

    let inserted = store.insert_operators(&new_operators).await?;
    counts.operators.inserted = inserted.len();
    cache.merge_operators(&inserted);

    info!(
        stations_inserted = counts.stations.inserted,
        stations_claimed = counts.stations.updated,
        operators_inserted = counts.operators.inserted,
        "dimensions synced"
    );
    Ok((Dimensions { cache }, counts))
}
