use std::fmt;

use chrono::{DateTime, Utc};
use railsync_core::FeedRecord;
use railsync_feed::DropCounts;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Progress of one reconciliation run. Each variant names the last step
/// whose writes are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    Start,
    CacheLoaded,
    DimensionsSynced,
    RoutesSynced,
    ServicesSynced,
    StopsSynced,
    CancellationsSynced,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::CacheLoaded => "CACHE_LOADED",
            Self::DimensionsSynced => "DIMENSIONS_SYNCED",
            Self::RoutesSynced => "ROUTES_SYNCED",
            Self::ServicesSynced => "SERVICES_SYNCED",
            Self::StopsSynced => "STOPS_SYNCED",
            Self::CancellationsSynced => "CANCELLATIONS_SYNCED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl EntityCounts {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Why a run ended in [`RunStage::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub attempted: RunStage,
    pub completed: RunStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batch_fingerprint: String,
    pub records: usize,
    pub stage: RunStage,
    pub stations: EntityCounts,
    pub operators: EntityCounts,
    pub routes: EntityCounts,
    pub services: EntityCounts,
    pub stops: EntityCounts,
    pub cancellations: EntityCounts,
    /// Existing services whose incoming route differs from the stored one.
    pub route_drift: usize,
    /// Records naming a stop an earlier record of the batch already named.
    pub duplicate_stops: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_dropped: Option<DropCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl RunSummary {
    pub(crate) fn start(
        records: &[FeedRecord],
        feed_dropped: Option<DropCounts>,
    ) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            batch_fingerprint: batch_fingerprint(records)?,
            records: records.len(),
            stage: RunStage::Start,
            stations: EntityCounts::default(),
            operators: EntityCounts::default(),
            routes: EntityCounts::default(),
            services: EntityCounts::default(),
            stops: EntityCounts::default(),
            cancellations: EntityCounts::default(),
            route_drift: 0,
            duplicate_stops: 0,
            feed_dropped,
            failure: None,
        })
    }

    pub fn total_writes(&self) -> usize {
        [
            self.stations,
            self.operators,
            self.routes,
            self.services,
            self.stops,
            self.cancellations,
        ]
        .iter()
        .map(EntityCounts::writes)
        .sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.stations.skipped
            + self.operators.skipped
            + self.routes.skipped
            + self.services.skipped
            + self.stops.skipped
            + self.cancellations.skipped
    }
}

/// sha256 over the canonical JSON of the batch; identical batches replayed
/// by the scheduler carry the same fingerprint.
pub fn batch_fingerprint(records: &[FeedRecord]) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    for record in records {
        serde_json::to_writer(&mut hasher, record)?;
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}
