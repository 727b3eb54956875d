use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use railsync_core::{
    CancellationId, CancellationRow, NewCancellation, NewService, NewStation, NewStop, OperatorId,
    OperatorRow, RouteId, RouteKey, RouteRow, ServiceId, ServiceRow, StationCrsUpdate, StationId,
    StationRow, StopId, StopKey, StopRow, StopUpdate,
};
use tokio::sync::Mutex;

use crate::{ReconcileStore, StoreError, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    Constraint,
}

impl InjectedFailure {
    fn into_error(self, op: WriteOp) -> StoreError {
        match self {
            Self::Unavailable => StoreError::Unavailable(format!("injected failure on {op:?}")),
            Self::Constraint => StoreError::constraint("injected", format!("injected failure on {op:?}")),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    stations: Vec<StationRow>,
    operators: Vec<OperatorRow>,
    routes: Vec<RouteRow>,
    services: Vec<ServiceRow>,
    stops: Vec<StopRow>,
    cancellations: Vec<CancellationRow>,
    write_statements: usize,
    failures: HashMap<WriteOp, InjectedFailure>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn begin_write(&mut self, op: WriteOp) -> Result<(), StoreError> {
        if let Some(failure) = self.failures.get(&op) {
            return Err(failure.into_error(op));
        }
        self.write_statements += 1;
        Ok(())
    }

    fn station_exists(&self, id: StationId) -> bool {
        self.stations.iter().any(|s| s.station_id == id)
    }
}

/// In-process store with the same unique and foreign-key constraints as the
/// Postgres schema. Each write validates the whole batch before applying it,
/// so a rejected batch leaves the tables untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail with `failure`.
    pub async fn fail_on(&self, op: WriteOp, failure: InjectedFailure) {
        self.tables.lock().await.failures.insert(op, failure);
    }

    pub async fn clear_failures(&self) {
        self.tables.lock().await.failures.clear();
    }

    /// Number of write statement groups executed so far.
    pub async fn write_statements(&self) -> usize {
        self.tables.lock().await.write_statements
    }

    pub async fn stations(&self) -> Vec<StationRow> {
        self.tables.lock().await.stations.clone()
    }

    pub async fn operators(&self) -> Vec<OperatorRow> {
        self.tables.lock().await.operators.clone()
    }

    pub async fn routes(&self) -> Vec<RouteRow> {
        self.tables.lock().await.routes.clone()
    }

    pub async fn services(&self) -> Vec<ServiceRow> {
        self.tables.lock().await.services.clone()
    }

    pub async fn stops(&self) -> Vec<StopRow> {
        self.tables.lock().await.stops.clone()
    }

    pub async fn cancellations(&self) -> Vec<CancellationRow> {
        self.tables.lock().await.cancellations.clone()
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn load_stations(&self) -> Result<Vec<StationRow>, StoreError> {
        Ok(self.stations().await)
    }

    async fn load_operators(&self) -> Result<Vec<OperatorRow>, StoreError> {
        Ok(self.operators().await)
    }

    async fn insert_stations(&self, rows: &[NewStation]) -> Result<Vec<StationRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::InsertStations)?;

        let mut crs_seen: HashSet<&str> =
            t.stations.iter().filter_map(|s| s.crs_code.as_deref()).collect();
        let mut endpoint_names: HashSet<&str> = t
            .stations
            .iter()
            .filter(|s| s.crs_code.is_none())
            .map(|s| s.name.as_str())
            .collect();
        for row in rows {
            let fresh = match row.crs_code.as_deref() {
                Some(crs) => crs_seen.insert(crs),
                None => endpoint_names.insert(row.name.as_str()),
            };
            if !fresh {
                return Err(StoreError::constraint(
                    "station",
                    format!("duplicate station {row:?}"),
                ));
            }
        }
        drop(crs_seen);
        drop(endpoint_names);

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let station = StationRow {
                station_id: StationId(t.next_id()),
                crs_code: row.crs_code.clone(),
                name: row.name.clone(),
            };
            t.stations.push(station.clone());
            inserted.push(station);
        }
        Ok(inserted)
    }

    async fn assign_station_crs(
        &self,
        updates: &[StationCrsUpdate],
    ) -> Result<Vec<StationRow>, StoreError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::AssignStationCrs)?;

        let mut crs_seen: HashSet<&str> =
            t.stations.iter().filter_map(|s| s.crs_code.as_deref()).collect();
        for update in updates {
            if !crs_seen.insert(update.crs_code.as_str()) {
                return Err(StoreError::constraint(
                    "station",
                    format!("duplicate station_crs {}", update.crs_code),
                ));
            }
        }
        drop(crs_seen);
        let claimable = updates
            .iter()
            .filter(|u| {
                t.stations
                    .iter()
                    .any(|s| s.station_id == u.station_id && s.crs_code.is_none())
            })
            .count();
        if claimable != updates.len() {
            return Err(StoreError::StaleRows {
                table: "station".to_string(),
                expected: updates.len() as u64,
                affected: claimable as u64,
            });
        }

        let mut updated = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(station) = t.stations.iter_mut().find(|s| s.station_id == update.station_id) {
                station.crs_code = Some(update.crs_code.clone());
                updated.push(station.clone());
            }
        }
        Ok(updated)
    }

    async fn insert_operators(&self, names: &[String]) -> Result<Vec<OperatorRow>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::InsertOperators)?;

        let mut seen: HashSet<&str> = t.operators.iter().map(|o| o.name.as_str()).collect();
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(StoreError::constraint(
                    "operator",
                    format!("duplicate operator_name {name}"),
                ));
            }
        }
        drop(seen);

        let mut inserted = Vec::with_capacity(names.len());
        for name in names {
            let operator = OperatorRow {
                operator_id: OperatorId(t.next_id()),
                name: name.clone(),
            };
            t.operators.push(operator.clone());
            inserted.push(operator);
        }
        Ok(inserted)
    }

    async fn load_routes(&self) -> Result<Vec<RouteRow>, StoreError> {
        Ok(self.routes().await)
    }

    async fn insert_routes(&self, keys: &[RouteKey]) -> Result<Vec<RouteRow>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::InsertRoutes)?;

        let mut seen: HashSet<RouteKey> = t.routes.iter().map(|r| r.key).collect();
        for key in keys {
            if !t.station_exists(key.origin_station_id)
                || !t.station_exists(key.destination_station_id)
                || !t.operators.iter().any(|o| o.operator_id == key.operator_id)
            {
                return Err(StoreError::constraint("route", format!("dangling reference in {key:?}")));
            }
            if !seen.insert(*key) {
                return Err(StoreError::constraint("route", format!("duplicate route {key:?}")));
            }
        }

        let mut inserted = Vec::with_capacity(keys.len());
        for key in keys {
            let route = RouteRow {
                route_id: RouteId(t.next_id()),
                key: *key,
            };
            t.routes.push(route);
            inserted.push(route);
        }
        Ok(inserted)
    }

    async fn load_services(&self, uids: &[String]) -> Result<Vec<ServiceRow>, StoreError> {
        let wanted: HashSet<&str> = uids.iter().map(String::as_str).collect();
        let t = self.tables.lock().await;
        Ok(t.services
            .iter()
            .filter(|s| wanted.contains(s.service_uid.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_services(&self, rows: &[NewService]) -> Result<Vec<ServiceRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::InsertServices)?;

        let mut seen: HashSet<String> = t.services.iter().map(|s| s.service_uid.clone()).collect();
        for row in rows {
            if !t.routes.iter().any(|r| r.route_id == row.route_id) {
                return Err(StoreError::constraint(
                    "train_service",
                    format!("route {} does not exist", row.route_id),
                ));
            }
            if !seen.insert(row.service_uid.clone()) {
                return Err(StoreError::constraint(
                    "train_service",
                    format!("duplicate service_uid {}", row.service_uid),
                ));
            }
        }

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let service = ServiceRow {
                service_id: ServiceId(t.next_id()),
                service_uid: row.service_uid.clone(),
                train_identity: row.train_identity.clone(),
                service_date: row.service_date,
                route_id: row.route_id,
            };
            t.services.push(service.clone());
            inserted.push(service);
        }
        Ok(inserted)
    }

    async fn load_stops(&self, service_ids: &[ServiceId]) -> Result<Vec<StopRow>, StoreError> {
        let wanted: HashSet<ServiceId> = service_ids.iter().copied().collect();
        let t = self.tables.lock().await;
        Ok(t.stops
            .iter()
            .filter(|s| wanted.contains(&s.key.service_id))
            .cloned()
            .collect())
    }

    async fn apply_stop_changes(
        &self,
        inserts: &[NewStop],
        updates: &[StopUpdate],
    ) -> Result<Vec<StopRow>, StoreError> {
        if inserts.is_empty() && updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::ApplyStopChanges)?;

        let mut seen: HashSet<StopKey> = t.stops.iter().map(|s| s.key).collect();
        for stop in inserts {
            if !t.services.iter().any(|s| s.service_id == stop.key.service_id)
                || !t.station_exists(stop.key.station_id)
            {
                return Err(StoreError::constraint(
                    "train_stop",
                    format!("dangling reference in {:?}", stop.key),
                ));
            }
            if !seen.insert(stop.key) {
                return Err(StoreError::constraint(
                    "train_stop",
                    format!("duplicate stop {:?}", stop.key),
                ));
            }
        }
        let missing = updates
            .iter()
            .filter(|u| !t.stops.iter().any(|s| s.stop_id == u.stop_id))
            .count();
        if missing > 0 {
            return Err(StoreError::StaleRows {
                table: "train_stop".to_string(),
                expected: updates.len() as u64,
                affected: (updates.len() - missing) as u64,
            });
        }

        let mut inserted = Vec::with_capacity(inserts.len());
        for stop in inserts {
            let row = StopRow {
                stop_id: StopId(t.next_id()),
                key: stop.key,
                fields: stop.fields.clone(),
            };
            t.stops.push(row.clone());
            inserted.push(row);
        }
        for update in updates {
            if let Some(row) = t.stops.iter_mut().find(|s| s.stop_id == update.stop_id) {
                row.fields = update.fields.clone();
            }
        }
        Ok(inserted)
    }

    async fn load_cancellations(
        &self,
        stop_ids: &[StopId],
    ) -> Result<Vec<CancellationRow>, StoreError> {
        let wanted: HashSet<StopId> = stop_ids.iter().copied().collect();
        let t = self.tables.lock().await;
        Ok(t.cancellations
            .iter()
            .filter(|c| wanted.contains(&c.stop_id))
            .cloned()
            .collect())
    }

    async fn insert_cancellations(
        &self,
        rows: &[NewCancellation],
    ) -> Result<Vec<CancellationRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut t = self.tables.lock().await;
        t.begin_write(WriteOp::InsertCancellations)?;

        let mut seen: HashSet<NewCancellation> = t.cancellations.iter().map(|c| c.fact()).collect();
        for row in rows {
            if !t.stops.iter().any(|s| s.stop_id == row.stop_id) {
                return Err(StoreError::constraint(
                    "cancellation",
                    format!("stop {} does not exist", row.stop_id),
                ));
            }
            if !seen.insert(row.clone()) {
                return Err(StoreError::constraint(
                    "cancellation",
                    format!("duplicate cancellation {row:?}"),
                ));
            }
        }

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let cancellation = CancellationRow {
                cancellation_id: CancellationId(t.next_id()),
                stop_id: row.stop_id,
                reason: row.reason.clone(),
            };
            t.cancellations.push(cancellation.clone());
            inserted.push(cancellation);
        }
        Ok(inserted)
    }
}
