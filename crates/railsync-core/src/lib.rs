//! Core domain model for the rail service reconciliation engine.
//!
//! Incoming data arrives as flat [`FeedRecord`]s, one per station visit of a
//! service. The store side is six surrogate-keyed tables; the row types here
//! mirror them one to one.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "railsync-core";

macro_rules! surrogate_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

surrogate_id!(
    /// `station.station_id`
    StationId,
    /// `operator.operator_id`
    OperatorId,
    /// `route.route_id`
    RouteId,
    /// `train_service.train_service_id`
    ServiceId,
    /// `train_stop.train_stop_id`
    StopId,
    /// `cancellation.cancellation_id`
    CancellationId,
);

/// One validated station visit of one service, as handed over by the feed
/// transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub service_uid: String,
    pub train_identity: String,
    pub station_name: String,
    pub station_crs: String,
    pub origin_name: String,
    pub destination_name: String,
    pub scheduled_arr_time: Option<NaiveTime>,
    pub actual_arr_time: Option<NaiveTime>,
    pub scheduled_dep_time: Option<NaiveTime>,
    pub actual_dep_time: Option<NaiveTime>,
    pub operator_name: String,
    pub service_date: NaiveDate,
    pub platform: Option<String>,
    pub platform_changed: bool,
    pub cancelled: bool,
    pub cancel_reason: Option<String>,
}

impl FeedRecord {
    pub fn route_names(&self) -> RouteNames<'_> {
        RouteNames {
            origin: &self.origin_name,
            destination: &self.destination_name,
            operator: &self.operator_name,
        }
    }

    pub fn stop_fields(&self) -> StopFields {
        StopFields {
            scheduled_arr_time: self.scheduled_arr_time,
            actual_arr_time: self.actual_arr_time,
            scheduled_dep_time: self.scheduled_dep_time,
            actual_dep_time: self.actual_dep_time,
            platform: self.platform.clone(),
            platform_changed: self.platform_changed,
        }
    }
}

/// Human-readable route triple carried by a record before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteNames<'a> {
    pub origin: &'a str,
    pub destination: &'a str,
    pub operator: &'a str,
}

/// The mutable part of a stop. Two stops are the same observation only when
/// every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StopFields {
    pub scheduled_arr_time: Option<NaiveTime>,
    pub actual_arr_time: Option<NaiveTime>,
    pub scheduled_dep_time: Option<NaiveTime>,
    pub actual_dep_time: Option<NaiveTime>,
    pub platform: Option<String>,
    pub platform_changed: bool,
}

/// A station to insert. Stations known only as a route's origin or
/// destination have no CRS code until a record visits them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStation {
    pub crs_code: Option<String>,
    pub name: String,
}

impl NewStation {
    pub fn visited(crs_code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            crs_code: Some(crs_code.into()),
            name: name.into(),
        }
    }

    pub fn endpoint(name: impl Into<String>) -> Self {
        Self {
            crs_code: None,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRow {
    pub station_id: StationId,
    pub crs_code: Option<String>,
    pub name: String,
}

/// Gives an endpoint-only station the CRS code of its first visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCrsUpdate {
    pub station_id: StationId,
    pub crs_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRow {
    pub operator_id: OperatorId,
    pub name: String,
}

/// Natural key of a route, expressed in surrogate ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub origin_station_id: StationId,
    pub destination_station_id: StationId,
    pub operator_id: OperatorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRow {
    pub route_id: RouteId,
    pub key: RouteKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewService {
    pub service_uid: String,
    pub train_identity: String,
    pub service_date: NaiveDate,
    pub route_id: RouteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRow {
    pub service_id: ServiceId,
    pub service_uid: String,
    pub train_identity: String,
    pub service_date: NaiveDate,
    pub route_id: RouteId,
}

/// Natural key of a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StopKey {
    pub service_id: ServiceId,
    pub station_id: StationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStop {
    pub key: StopKey,
    pub fields: StopFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRow {
    pub stop_id: StopId,
    pub key: StopKey,
    pub fields: StopFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopUpdate {
    pub stop_id: StopId,
    pub fields: StopFields,
}

/// A cancellation fact. Facts are append-only: a new reason for an already
/// cancelled stop is a new fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewCancellation {
    pub stop_id: StopId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRow {
    pub cancellation_id: CancellationId,
    pub stop_id: StopId,
    pub reason: Option<String>,
}

impl CancellationRow {
    pub fn fact(&self) -> NewCancellation {
        NewCancellation {
            stop_id: self.stop_id,
            reason: self.reason.clone(),
        }
    }
}
