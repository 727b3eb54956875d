use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use railsync_core::{
    CancellationId, CancellationRow, NewCancellation, NewService, NewStation, NewStop, OperatorId,
    OperatorRow, RouteId, RouteKey, RouteRow, ServiceId, ServiceRow, StationCrsUpdate, StationId,
    StationRow, StopFields, StopId, StopKey, StopRow, StopUpdate,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::{ReconcileStore, StoreError, WriteOp};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Keeps every statement well under Postgres' 65535 bind parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

const STOP_COLUMNS: &str = "train_stop_id, train_service_id, station_id, scheduled_arr_time, \
     actual_arr_time, scheduled_dep_time, actual_dep_time, platform, platform_changed";

/// Postgres-backed store. The pool is owned by the caller; a run expects it
/// to hand out a single connection.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn station_from_row(row: &PgRow) -> Result<StationRow, sqlx::Error> {
    Ok(StationRow {
        station_id: StationId(row.try_get("station_id")?),
        crs_code: row.try_get("station_crs")?,
        name: row.try_get("station_name")?,
    })
}

fn operator_from_row(row: &PgRow) -> Result<OperatorRow, sqlx::Error> {
    Ok(OperatorRow {
        operator_id: OperatorId(row.try_get("operator_id")?),
        name: row.try_get("operator_name")?,
    })
}

fn route_from_row(row: &PgRow) -> Result<RouteRow, sqlx::Error> {
    Ok(RouteRow {
        route_id: RouteId(row.try_get("route_id")?),
        key: RouteKey {
            origin_station_id: StationId(row.try_get("origin_station_id")?),
            destination_station_id: StationId(row.try_get("destination_station_id")?),
            operator_id: OperatorId(row.try_get("operator_id")?),
        },
    })
}

fn service_from_row(row: &PgRow) -> Result<ServiceRow, sqlx::Error> {
    Ok(ServiceRow {
        service_id: ServiceId(row.try_get("train_service_id")?),
        service_uid: row.try_get("service_uid")?,
        train_identity: row.try_get("train_identity")?,
        service_date: row.try_get::<NaiveDate, _>("service_date")?,
        route_id: RouteId(row.try_get("route_id")?),
    })
}

fn stop_from_row(row: &PgRow) -> Result<StopRow, sqlx::Error> {
    Ok(StopRow {
        stop_id: StopId(row.try_get("train_stop_id")?),
        key: StopKey {
            service_id: ServiceId(row.try_get("train_service_id")?),
            station_id: StationId(row.try_get("station_id")?),
        },
        fields: StopFields {
            scheduled_arr_time: row.try_get::<Option<NaiveTime>, _>("scheduled_arr_time")?,
            actual_arr_time: row.try_get::<Option<NaiveTime>, _>("actual_arr_time")?,
            scheduled_dep_time: row.try_get::<Option<NaiveTime>, _>("scheduled_dep_time")?,
            actual_dep_time: row.try_get::<Option<NaiveTime>, _>("actual_dep_time")?,
            platform: row.try_get("platform")?,
            platform_changed: row.try_get("platform_changed")?,
        },
    })
}

fn cancellation_from_row(row: &PgRow) -> Result<CancellationRow, sqlx::Error> {
    Ok(CancellationRow {
        cancellation_id: CancellationId(row.try_get("cancellation_id")?),
        stop_id: StopId(row.try_get("train_stop_id")?),
        reason: row.try_get("reason")?,
    })
}

fn decode_all<T>(
    rows: Vec<PgRow>,
    decode: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|row| decode(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn load_stations(&self) -> Result<Vec<StationRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT station_id, station_crs, station_name
              FROM station
             ORDER BY station_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, station_from_row)
    }

    async fn load_operators(&self) -> Result<Vec<OperatorRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT operator_id, operator_name
              FROM operator
             ORDER BY operator_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, operator_from_row)
    }

    async fn insert_stations(&self, rows: &[NewStation]) -> Result<Vec<StationRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO station (station_crs, station_name) ");
            qb.push_values(chunk, |mut b, station| {
                b.push_bind(station.crs_code.clone())
                    .push_bind(station.name.clone());
            });
            qb.push(" RETURNING station_id, station_crs, station_name");
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, station_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::InsertStations, rows = inserted.len(), "committed");
        Ok(inserted)
    }

    async fn assign_station_crs(
        &self,
        updates: &[StationCrsUpdate],
    ) -> Result<Vec<StationRow>, StoreError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(updates.len());
        for chunk in updates.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("UPDATE station AS s SET station_crs = v.station_crs FROM (");
            qb.push_values(chunk, |mut b, update| {
                b.push_bind(update.station_id.0)
                    .push_bind(update.crs_code.clone());
            });
            qb.push(
                ") AS v (station_id, station_crs) \
                 WHERE s.station_id = v.station_id AND s.station_crs IS NULL \
                 RETURNING s.station_id, s.station_crs, s.station_name",
            );
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            if fetched.len() != chunk.len() {
                return Err(StoreError::StaleRows {
                    table: "station".to_string(),
                    expected: chunk.len() as u64,
                    affected: fetched.len() as u64,
                });
            }
            updated.extend(decode_all(fetched, station_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::AssignStationCrs, rows = updated.len(), "committed");
        Ok(updated)
    }

    async fn insert_operators(&self, names: &[String]) -> Result<Vec<OperatorRow>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(names.len());
        for chunk in names.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO operator (operator_name) ");
            qb.push_values(chunk, |mut b, name| {
                b.push_bind(name.clone());
            });
            qb.push(" RETURNING operator_id, operator_name");
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, operator_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::InsertOperators, rows = inserted.len(), "committed");
        Ok(inserted)
    }

    async fn load_routes(&self) -> Result<Vec<RouteRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT route_id, origin_station_id, destination_station_id, operator_id
              FROM route
             ORDER BY route_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, route_from_row)
    }

    async fn insert_routes(&self, keys: &[RouteKey]) -> Result<Vec<RouteRow>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO route (origin_station_id, destination_station_id, operator_id) ",
            );
            qb.push_values(chunk, |mut b, key| {
                b.push_bind(key.origin_station_id.0)
                    .push_bind(key.destination_station_id.0)
                    .push_bind(key.operator_id.0);
            });
            qb.push(" RETURNING route_id, origin_station_id, destination_station_id, operator_id");
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, route_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::InsertRoutes, rows = inserted.len(), "committed");
        Ok(inserted)
    }

    async fn load_services(&self, uids: &[String]) -> Result<Vec<ServiceRow>, StoreError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT train_service_id, service_uid, train_identity, service_date, route_id
              FROM train_service
             WHERE service_uid = ANY($1)
            "#,
        )
        .bind(uids)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, service_from_row)
    }

    async fn insert_services(&self, rows: &[NewService]) -> Result<Vec<ServiceRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO train_service (service_uid, train_identity, service_date, route_id) ",
            );
            qb.push_values(chunk, |mut b, service| {
                b.push_bind(service.service_uid.clone())
                    .push_bind(service.train_identity.clone())
                    .push_bind(service.service_date)
                    .push_bind(service.route_id.0);
            });
            qb.push(" RETURNING train_service_id, service_uid, train_identity, service_date, route_id");
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, service_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::InsertServices, rows = inserted.len(), "committed");
        Ok(inserted)
    }

    async fn load_stops(&self, service_ids: &[ServiceId]) -> Result<Vec<StopRow>, StoreError> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = service_ids.iter().map(|id| id.0).collect::<Vec<_>>();
        let rows = sqlx::query(&format!(
            "SELECT {STOP_COLUMNS} FROM train_stop WHERE train_service_id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, stop_from_row)
    }

    async fn apply_stop_changes(
        &self,
        inserts: &[NewStop],
        updates: &[StopUpdate],
    ) -> Result<Vec<StopRow>, StoreError> {
        if inserts.is_empty() && updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        let mut inserted = Vec::with_capacity(inserts.len());
        for chunk in inserts.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO train_stop (train_service_id, station_id, scheduled_arr_time, \
                 actual_arr_time, scheduled_dep_time, actual_dep_time, platform, platform_changed) ",
            );
            qb.push_values(chunk, |mut b, stop| {
                b.push_bind(stop.key.service_id.0)
                    .push_bind(stop.key.station_id.0)
                    .push_bind(stop.fields.scheduled_arr_time)
                    .push_bind(stop.fields.actual_arr_time)
                    .push_bind(stop.fields.scheduled_dep_time)
                    .push_bind(stop.fields.actual_dep_time)
                    .push_bind(stop.fields.platform.clone())
                    .push_bind(stop.fields.platform_changed);
            });
            qb.push(" RETURNING ");
            qb.push(STOP_COLUMNS);
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, stop_from_row)?);
        }

        for chunk in updates.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "UPDATE train_stop AS s \
                    SET scheduled_arr_time = v.scheduled_arr_time, \
                        actual_arr_time = v.actual_arr_time, \
                        scheduled_dep_time = v.scheduled_dep_time, \
                        actual_dep_time = v.actual_dep_time, \
                        platform = v.platform, \
                        platform_changed = v.platform_changed \
                   FROM (",
            );
            qb.push_values(chunk, |mut b, update| {
                b.push_bind(update.stop_id.0)
                    .push_bind(update.fields.scheduled_arr_time)
                    .push_bind(update.fields.actual_arr_time)
                    .push_bind(update.fields.scheduled_dep_time)
                    .push_bind(update.fields.actual_dep_time)
                    .push_bind(update.fields.platform.clone())
                    .push_bind(update.fields.platform_changed);
            });
            qb.push(
                ") AS v (train_stop_id, scheduled_arr_time, actual_arr_time, scheduled_dep_time, \
                 actual_dep_time, platform, platform_changed) \
                 WHERE s.train_stop_id = v.train_stop_id",
            );
            let affected = qb.build().execute(&mut *tx).await?.rows_affected();
            if affected != chunk.len() as u64 {
                return Err(StoreError::StaleRows {
                    table: "train_stop".to_string(),
                    expected: chunk.len() as u64,
                    affected,
                });
            }
        }

        tx.commit().await?;
        debug!(
            op = ?WriteOp::ApplyStopChanges,
            inserted = inserted.len(),
            updated = updates.len(),
            "committed"
        );
        Ok(inserted)
    }

    async fn load_cancellations(
        &self,
        stop_ids: &[StopId],
    ) -> Result<Vec<CancellationRow>, StoreError> {
        if stop_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = stop_ids.iter().map(|id| id.0).collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            SELECT cancellation_id, train_stop_id, reason
              FROM cancellation
             WHERE train_stop_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, cancellation_from_row)
    }

    async fn insert_cancellations(
        &self,
        rows: &[NewCancellation],
    ) -> Result<Vec<CancellationRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO cancellation (train_stop_id, reason) ");
            qb.push_values(chunk, |mut b, cancellation| {
                b.push_bind(cancellation.stop_id.0)
                    .push_bind(cancellation.reason.clone());
            });
            qb.push(" RETURNING cancellation_id, train_stop_id, reason");
            let fetched = qb.build().fetch_all(&mut *tx).await?;
            inserted.extend(decode_all(fetched, cancellation_from_row)?);
        }
        tx.commit().await?;
        debug!(op = ?WriteOp::InsertCancellations, rows = inserted.len(), "committed");
        Ok(inserted)
    }
}
