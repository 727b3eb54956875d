//! Relational store seam for the reconciliation engine.
//!
//! [`ReconcileStore`] exposes one method per batched statement group. Write
//! methods commit before they return, so every synchronizer leaves the store
//! in a state the next run can diff against.

use async_trait::async_trait;
use railsync_core::{
    CancellationRow, NewCancellation, NewService, NewStation, NewStop, OperatorRow, RouteKey,
    RouteRow, ServiceId, ServiceRow, StationCrsUpdate, StationRow, StopId, StopRow, StopUpdate,
};
use thiserror::Error;

mod memory;
mod pg;

pub use memory::{InjectedFailure, MemoryStore};
pub use pg::PgStore;

pub const CRATE_NAME: &str = "railsync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation on {table}: {detail}")]
    Constraint { table: String, detail: String },
    #[error("update on {table} touched {affected} rows, expected {expected}")]
    StaleRows {
        table: String,
        expected: u64,
        affected: u64,
    },
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn constraint(table: &str, detail: impl Into<String>) -> Self {
        Self::Constraint {
            table: table.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation() || db.is_foreign_key_violation() =>
            {
                Self::Constraint {
                    table: db.table().unwrap_or("unknown").to_string(),
                    detail: db.message().to_string(),
                }
            }
            _ => Self::Query(err),
        }
    }
}

/// Identifies a write statement group, for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    InsertStations,
    AssignStationCrs,
    InsertOperators,
    InsertRoutes,
    InsertServices,
    ApplyStopChanges,
    InsertCancellations,
}

#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn load_stations(&self) -> Result<Vec<StationRow>, StoreError>;

    async fn load_operators(&self) -> Result<Vec<OperatorRow>, StoreError>;

    async fn insert_stations(&self, rows: &[NewStation]) -> Result<Vec<StationRow>, StoreError>;

    /// Set the CRS code of stations that have none yet. Returns the updated rows.
    async fn assign_station_crs(
        &self,
        updates: &[StationCrsUpdate],
    ) -> Result<Vec<StationRow>, StoreError>;

    async fn insert_operators(&self, names: &[String]) -> Result<Vec<OperatorRow>, StoreError>;

    async fn load_routes(&self) -> Result<Vec<RouteRow>, StoreError>;

    async fn insert_routes(&self, keys: &[RouteKey]) -> Result<Vec<RouteRow>, StoreError>;

    /// Services whose `service_uid` is in `uids`.
    async fn load_services(&self, uids: &[String]) -> Result<Vec<ServiceRow>, StoreError>;

    async fn insert_services(&self, rows: &[NewService]) -> Result<Vec<ServiceRow>, StoreError>;

    /// Stops belonging to any of `service_ids`.
    async fn load_stops(&self, service_ids: &[ServiceId]) -> Result<Vec<StopRow>, StoreError>;

    /// Inserts and updates are applied under one commit. Returns the inserted rows.
    async fn apply_stop_changes(
        &self,
        inserts: &[NewStop],
        updates: &[StopUpdate],
    ) -> Result<Vec<StopRow>, StoreError>;

    async fn load_cancellations(
        &self,
        stop_ids: &[StopId],
    ) -> Result<Vec<CancellationRow>, StoreError>;

    async fn insert_cancellations(
        &self,
        rows: &[NewCancellation],
    ) -> Result<Vec<CancellationRow>, StoreError>;
}
