use std::collections::HashMap;

use railsync_core::{OperatorId, OperatorRow, StationId, StationRow};
use railsync_store::{ReconcileStore, StoreError};
use tracing::debug;

/// In-memory natural key → surrogate key maps for the dimension tables.
///
/// Loaded once per run by the orchestrator and extended with the rows the
/// dimension synchronizer inserts. Nothing outside the run holds on to it.
#[derive(Debug, Clone, Default)]
pub struct LookupCache {
    stations_by_crs: HashMap<String, StationId>,
    stations_by_name: HashMap<String, StationId>,
    /// Stations known only as a route endpoint, still without a CRS code.
    endpoints_by_name: HashMap<String, StationId>,
    operators: HashMap<String, OperatorId>,
}

impl LookupCache {
    pub async fn load(store: &dyn ReconcileStore) -> Result<Self, StoreError> {
        let stations = store.load_stations().await?;
        let operators = store.load_operators().await?;
        let cache = Self::from_rows(&stations, &operators);
        debug!(
            stations = cache.station_count(),
            operators = cache.operator_count(),
            "lookup cache loaded"
        );
        Ok(cache)
    }

    pub fn from_rows(stations: &[StationRow], operators: &[OperatorRow]) -> Self {
        let mut cache = Self::default();
        cache.merge_stations(stations);
        cache.merge_operators(operators);
        cache
    }

    /// When two stations share a display name the first one merged keeps the
    /// name; stores hand rows back in id order, so that is the lowest id.
    pub fn merge_stations(&mut self, rows: &[StationRow]) {
        for row in rows {
            match &row.crs_code {
                Some(crs) => {
                    self.stations_by_crs.insert(crs.clone(), row.station_id);
                    if self.endpoints_by_name.get(&row.name) == Some(&row.station_id) {
                        self.endpoints_by_name.remove(&row.name);
                    }
                }
                None => {
                    self.endpoints_by_name
                        .entry(row.name.clone())
                        .or_insert(row.station_id);
                }
            }
            self.stations_by_name
                .entry(row.name.clone())
                .or_insert(row.station_id);
        }
    }

    pub fn merge_operators(&mut self, rows: &[OperatorRow]) {
        for row in rows {
            self.operators.insert(row.name.clone(), row.operator_id);
        }
    }

    pub fn station_by_crs(&self, crs: &str) -> Option<StationId> {
        self.stations_by_crs.get(crs).copied()
    }

    pub fn station_by_name(&self, name: &str) -> Option<StationId> {
        self.stations_by_name.get(name).copied()
    }

    /// A station with this name that has no CRS code yet.
    pub fn endpoint_by_name(&self, name: &str) -> Option<StationId> {
        self.endpoints_by_name.get(name).copied()
    }

    pub fn operator(&self, name: &str) -> Option<OperatorId> {
        self.operators.get(name).copied()
    }

    pub fn station_count(&self) -> usize {
        self.stations_by_crs.len() + self.endpoints_by_name.len()
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }
}
