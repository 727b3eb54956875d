use std::collections::HashSet;
use std::io::Write;

use chrono::{NaiveDate, NaiveTime};
use railsync_core::FeedRecord;
use railsync_store::{InjectedFailure, MemoryStore, WriteOp};
use railsync_sync::{RunStage, SyncError, SyncPipeline};

const PAD: (&str, &str) = ("PAD", "London Paddington");
const BRI: (&str, &str) = ("BRI", "Bristol Temple Meads");
const RDG: (&str, &str) = ("RDG", "Reading");

fn hm(h: u32, m: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(h, m, 0)
}

fn visit(uid: &str, at: (&str, &str), origin: &str, destination: &str) -> FeedRecord {
    FeedRecord {
        service_uid: uid.to_string(),
        train_identity: "1A01".to_string(),
        station_name: at.1.to_string(),
        station_crs: at.0.to_string(),
        origin_name: origin.to_string(),
        destination_name: destination.to_string(),
        scheduled_arr_time: None,
        actual_arr_time: None,
        scheduled_dep_time: hm(10, 0),
        actual_dep_time: hm(10, 0),
        operator_name: "GWR".to_string(),
        service_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        platform: Some("1".to_string()),
        platform_changed: false,
        cancelled: false,
        cancel_reason: None,
    }
}

fn pad_to_bri(uid: &str, at: (&str, &str)) -> FeedRecord {
    visit(uid, at, PAD.1, BRI.1)
}

fn write_batch(dir: &std::path::Path, rows: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("batch.json");
    let mut file = std::fs::File::create(&path).expect("create batch");
    file.write_all(rows.to_string().as_bytes()).expect("write batch");
    path
}

#[tokio::test]
async fn paddington_scenario_inserts_once_then_updates_one_stop() {
    let pipeline = SyncPipeline::new(MemoryStore::new());

    let batch = vec![pad_to_bri("G12345", PAD)];
    let first = pipeline.run_batch(&batch).await.expect("first run");
    assert_eq!(first.stage, RunStage::Done);
    assert_eq!(first.stations.inserted, 2);
    assert_eq!(first.stations.unchanged, 0);
    assert_eq!(first.operators.inserted, 1);
    assert_eq!(first.routes.inserted, 1);
    assert_eq!(first.services.inserted, 1);
    assert_eq!(first.stops.inserted, 1);
    assert_eq!(first.cancellations.inserted, 0);

    let writes_after_first = pipeline.store().write_statements().await;
    let second = pipeline.run_batch(&batch).await.expect("second run");
    assert_eq!(second.total_writes(), 0);
    assert_eq!(second.stops.unchanged, 1);
    assert_eq!(pipeline.store().write_statements().await, writes_after_first);
    assert_eq!(second.batch_fingerprint, first.batch_fingerprint);

    let mut late = batch.clone();
    late[0].actual_dep_time = hm(10, 7);
    let third = pipeline.run_batch(&late).await.expect("third run");
    assert_eq!(third.total_writes(), 1);
    assert_eq!(third.stops.updated, 1);
    assert_eq!(third.stops.inserted, 0);
    assert_ne!(third.batch_fingerprint, first.batch_fingerprint);

    let stops = pipeline.store().stops().await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].fields.actual_dep_time, hm(10, 7));
    assert_eq!(stops[0].fields.scheduled_dep_time, hm(10, 0));
}

#[tokio::test]
async fn both_endpoints_new_in_one_batch() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let batch = vec![pad_to_bri("G12345", PAD), pad_to_bri("G12345", BRI)];

    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.stations.inserted, 2);
    assert_eq!(summary.routes.inserted, 1);
    assert_eq!(summary.services.inserted, 1);
    assert_eq!(summary.stops.inserted, 2);
    assert_eq!(summary.total_skipped(), 0);
}

#[tokio::test]
async fn platform_change_updates_in_place() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI)];
    pipeline.run_batch(&batch).await.expect("first run");

    batch[1].platform = Some("4".to_string());
    batch[1].platform_changed = true;
    let summary = pipeline.run_batch(&batch).await.expect("second run");
    assert_eq!(summary.stops.updated, 1);
    assert_eq!(summary.stops.unchanged, 1);
    assert_eq!(summary.stops.inserted, 0);

    let stops = pipeline.store().stops().await;
    assert_eq!(stops.len(), 2);
    let changed = stops
        .iter()
        .filter(|s| s.fields.platform.as_deref() == Some("4"))
        .collect::<Vec<_>>();
    assert_eq!(changed.len(), 1);
    assert!(changed[0].fields.platform_changed);
}

#[tokio::test]
async fn subset_replay_writes_nothing() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let batch = vec![
        pad_to_bri("G1", PAD),
        pad_to_bri("G1", RDG),
        pad_to_bri("G1", BRI),
        visit("G2", RDG, RDG.1, PAD.1),
        visit("G2", PAD, RDG.1, PAD.1),
    ];
    pipeline.run_batch(&batch).await.expect("full run");
    let writes = pipeline.store().write_statements().await;

    let subset = vec![batch[1].clone(), batch[4].clone()];
    let summary = pipeline.run_batch(&subset).await.expect("subset run");
    assert_eq!(summary.total_writes(), 0);
    assert_eq!(pipeline.store().write_statements().await, writes);
}

#[tokio::test]
async fn natural_keys_stay_unique_across_overlapping_batches() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let morning = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI), pad_to_bri("G2", PAD)];
    let midday = vec![pad_to_bri("G2", PAD), pad_to_bri("G2", BRI), pad_to_bri("G3", BRI)];
    for batch in [&morning, &midday, &morning] {
        pipeline.run_batch(batch).await.expect("run");
    }

    let store = pipeline.store();
    let stations = store.stations().await;
    let crs = stations
        .iter()
        .filter_map(|s| s.crs_code.as_deref())
        .collect::<HashSet<_>>();
    assert_eq!(crs.len(), stations.len());
    assert_eq!(store.operators().await.len(), 1);
    assert_eq!(store.routes().await.len(), 1);

    let services = store.services().await;
    let uids = services.iter().map(|s| s.service_uid.as_str()).collect::<HashSet<_>>();
    assert_eq!(uids.len(), 3);
    assert_eq!(services.len(), 3);

    let stops = store.stops().await;
    let keys = stops.iter().map(|s| s.key).collect::<HashSet<_>>();
    assert_eq!(keys.len(), stops.len());
    assert_eq!(stops.len(), 5);
}

#[tokio::test]
async fn stops_only_reference_existing_rows() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let batch = vec![
        pad_to_bri("G1", PAD),
        pad_to_bri("G1", BRI),
        visit("G9", PAD, PAD.1, "Nowhere Junction"),
    ];
    pipeline.run_batch(&batch).await.expect("run");

    let store = pipeline.store();
    let station_ids = store.stations().await.iter().map(|s| s.station_id).collect::<HashSet<_>>();
    let service_ids = store.services().await.iter().map(|s| s.service_id).collect::<HashSet<_>>();
    for stop in store.stops().await {
        assert!(station_ids.contains(&stop.key.station_id));
        assert!(service_ids.contains(&stop.key.service_id));
    }
}

#[tokio::test]
async fn unresolved_route_is_skipped_not_fatal() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let batch = vec![
        pad_to_bri("G1", PAD),
        pad_to_bri("G1", BRI),
        visit("G9", PAD, PAD.1, "  "),
    ];
    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.stage, RunStage::Done);
    assert_eq!(summary.routes.skipped, 1);
    assert_eq!(summary.services.skipped, 1);
    assert_eq!(summary.stops.skipped, 1);
    assert_eq!(summary.services.inserted, 1);
    assert_eq!(pipeline.store().services().await.len(), 1);
}

#[tokio::test]
async fn blank_operator_skips_the_service() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut orphan = pad_to_bri("G2", PAD);
    orphan.operator_name = "  ".to_string();
    let batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI), orphan];

    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.operators.inserted, 1);
    assert_eq!(summary.operators.skipped, 1);
    assert_eq!(summary.services.inserted, 1);
    assert_eq!(summary.services.skipped, 1);
}

#[tokio::test]
async fn cancellations_are_append_only() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI)];
    batch[1].cancelled = true;
    batch[1].cancel_reason = Some("Signalling fault".to_string());

    let first = pipeline.run_batch(&batch).await.expect("first run");
    assert_eq!(first.cancellations.inserted, 1);

    let mut revised = batch.clone();
    revised[1].cancel_reason = Some("Trespass on the line".to_string());
    let second = pipeline.run_batch(&revised).await.expect("revised run");
    assert_eq!(second.cancellations.inserted, 1);

    let third = pipeline.run_batch(&batch).await.expect("replay of first batch");
    assert_eq!(third.cancellations.inserted, 0);
    assert_eq!(third.cancellations.unchanged, 1);

    let mut uncancelled = batch.clone();
    uncancelled[1].cancelled = false;
    uncancelled[1].cancel_reason = None;
    pipeline.run_batch(&uncancelled).await.expect("uncancelled run");

    let mut reasons = pipeline
        .store()
        .cancellations()
        .await
        .into_iter()
        .map(|c| c.reason.unwrap_or_default())
        .collect::<Vec<_>>();
    reasons.sort();
    assert_eq!(reasons, vec!["Signalling fault", "Trespass on the line"]);
}

#[tokio::test]
async fn first_name_wins_for_a_crs_code() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut renamed = pad_to_bri("G2", PAD);
    renamed.station_name = "Paddington".to_string();
    let batch = vec![pad_to_bri("G1", PAD), renamed, pad_to_bri("G1", BRI)];

    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.stations.inserted, 2);
    let pad = pipeline
        .store()
        .stations()
        .await
        .into_iter()
        .find(|s| s.crs_code.as_deref() == Some("PAD"))
        .expect("PAD stored");
    assert_eq!(pad.name, PAD.1);
}

#[tokio::test]
async fn failed_step_keeps_earlier_commits_and_replays_cleanly() {
    let store = MemoryStore::new();
    store
        .fail_on(WriteOp::InsertRoutes, InjectedFailure::Unavailable)
        .await;
    let pipeline = SyncPipeline::new(store);
    let batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI)];

    let err = pipeline.run_batch(&batch).await.expect_err("routes fail");
    let SyncError::StageFailed {
        attempted,
        completed,
        ..
    } = &err
    else {
        panic!("expected a stage failure, got {err:?}");
    };
    assert_eq!(*attempted, RunStage::RoutesSynced);
    assert_eq!(*completed, RunStage::DimensionsSynced);
    let partial = err.partial_summary().expect("partial summary");
    assert_eq!(partial.stage, RunStage::Failed);
    assert_eq!(partial.stations.inserted, 2);
    assert_eq!(pipeline.store().stations().await.len(), 2);
    assert!(pipeline.store().routes().await.is_empty());

    pipeline.store().clear_failures().await;
    let summary = pipeline.run_batch(&batch).await.expect("retry");
    assert_eq!(summary.stations.inserted, 0);
    assert_eq!(summary.stations.unchanged, 2);
    assert_eq!(summary.routes.inserted, 1);
    assert_eq!(summary.stops.inserted, 2);
    assert_eq!(pipeline.store().stations().await.len(), 2);
}

#[tokio::test]
async fn constraint_violation_fails_the_run() {
    let store = MemoryStore::new();
    store
        .fail_on(WriteOp::ApplyStopChanges, InjectedFailure::Constraint)
        .await;
    let pipeline = SyncPipeline::new(store);

    let err = pipeline
        .run_batch(&[pad_to_bri("G1", PAD), pad_to_bri("G1", BRI)])
        .await
        .expect_err("stop write fails");
    assert!(err
        .store_error()
        .is_some_and(|source| source.is_constraint_violation()));
    let failure = err
        .partial_summary()
        .and_then(|partial| partial.failure.clone())
        .expect("failure recorded");
    assert_eq!(failure.attempted, RunStage::StopsSynced);
    assert_eq!(failure.completed, RunStage::ServicesSynced);
    assert_eq!(pipeline.store().services().await.len(), 1);
}

#[tokio::test]
async fn route_change_for_existing_service_is_reported_not_applied() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI), pad_to_bri("G1", RDG)];
    pipeline.run_batch(&batch).await.expect("first run");
    let original_route = pipeline.store().services().await[0].route_id;

    let diverted = vec![visit("G1", PAD, PAD.1, RDG.1), visit("G1", RDG, PAD.1, RDG.1)];
    let summary = pipeline.run_batch(&diverted).await.expect("diverted run");
    assert_eq!(summary.route_drift, 1);
    assert_eq!(summary.routes.inserted, 1);
    assert_eq!(summary.services.inserted, 0);
    assert_eq!(pipeline.store().services().await[0].route_id, original_route);
}

#[tokio::test]
async fn run_from_file_normalizes_and_writes_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = serde_json::json!([
        {
            "service_uid": "G12345", "train_identity": "1A01",
            "station_name": "London Paddington", "station_crs": "PAD",
            "origin_name": "London Paddington", "destination_name": "Bristol Temple Meads",
            "scheduled_arr_time": null, "actual_arr_time": null,
            "scheduled_dep_time": "1000", "actual_dep_time": "1000",
            "operator_name": "GWR", "service_date": "2024-05-01",
            "platform": "1", "platform_changed": "false", "cancelled": "false",
            "cancel_reason": null, "service_type": "train"
        },
        {
            "service_uid": "G12345", "train_identity": "1A01",
            "station_name": "Bristol Temple Meads", "station_crs": "BRI",
            "origin_name": "London Paddington", "destination_name": "Bristol Temple Meads",
            "scheduled_arr_time": "1145", "actual_arr_time": "1150",
            "scheduled_dep_time": null, "actual_dep_time": null,
            "operator_name": "GWR", "service_date": "2024-05-01",
            "platform": "3", "platform_changed": true, "cancelled": false,
            "cancel_reason": null, "service_type": "train"
        },
        {
            "service_uid": "B1", "train_identity": "0B00",
            "station_name": "Reading", "station_crs": "RDG",
            "origin_name": "Reading", "destination_name": "Oxford",
            "scheduled_arr_time": null, "actual_arr_time": null,
            "scheduled_dep_time": "0900", "actual_dep_time": "0900",
            "operator_name": "Bus Co", "service_date": "2024-05-01",
            "platform": "BUS", "platform_changed": false, "cancelled": false,
            "cancel_reason": null, "service_type": "bus"
        }
    ]);
    let batch_path = write_batch(dir.path(), &rows);

    let reports = dir.path().join("reports");
    let pipeline = SyncPipeline::new(MemoryStore::new()).with_reports_dir(&reports);
    let summary = pipeline.run_from_file(&batch_path).await.expect("run");

    assert_eq!(summary.records, 2);
    assert_eq!(summary.feed_dropped.as_ref().map(|d| d.non_train), Some(1));
    assert_eq!(summary.stops.inserted, 2);

    let report_path = reports
        .join(summary.run_id.to_string())
        .join("run_summary.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).expect("report")).expect("json");
    assert_eq!(report["stage"], "DONE");
    assert_eq!(report["stops"]["inserted"], 2);
    assert_eq!(report["feed_dropped"]["non_train"], 1);

    let bristol = pipeline
        .store()
        .stops()
        .await
        .into_iter()
        .find(|s| s.fields.platform.as_deref() == Some("3"))
        .expect("bristol stop");
    assert_eq!(bristol.fields.actual_arr_time, hm(11, 50));
    assert!(bristol.fields.platform_changed);
}

#[tokio::test]
async fn endpoint_station_is_claimed_by_its_first_visit() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    pipeline
        .run_batch(&[pad_to_bri("G1", PAD)])
        .await
        .expect("first run");
    let bristol = pipeline
        .store()
        .stations()
        .await
        .into_iter()
        .find(|s| s.name == BRI.1)
        .expect("endpoint station");
    assert_eq!(bristol.crs_code, None);

    let summary = pipeline
        .run_batch(&[pad_to_bri("G1", BRI)])
        .await
        .expect("visit run");
    assert_eq!(summary.stations.updated, 1);
    assert_eq!(summary.stations.inserted, 0);
    assert_eq!(summary.routes.inserted, 0);
    assert_eq!(summary.stops.inserted, 1);

    let stations = pipeline.store().stations().await;
    assert_eq!(stations.len(), 2);
    let claimed = stations
        .iter()
        .find(|s| s.station_id == bristol.station_id)
        .expect("same row");
    assert_eq!(claimed.crs_code.as_deref(), Some(BRI.0));
    assert_eq!(pipeline.store().routes().await.len(), 1);
}

#[tokio::test]
async fn failed_run_report_records_the_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = serde_json::json!([{
        "service_uid": "G1", "train_identity": "1A01",
        "station_name": "London Paddington", "station_crs": "PAD",
        "origin_name": "London Paddington", "destination_name": "Bristol Temple Meads",
        "scheduled_arr_time": null, "actual_arr_time": null,
        "scheduled_dep_time": "1000", "actual_dep_time": "1000",
        "operator_name": "GWR", "service_date": "2024-05-01",
        "platform": "1", "platform_changed": false, "cancelled": false,
        "cancel_reason": null, "service_type": "train"
    }]);
    let batch_path = write_batch(dir.path(), &rows);

    let store = MemoryStore::new();
    store
        .fail_on(WriteOp::InsertRoutes, InjectedFailure::Unavailable)
        .await;
    let reports = dir.path().join("reports");
    let pipeline = SyncPipeline::new(store).with_reports_dir(&reports);
    let err = pipeline
        .run_from_file(&batch_path)
        .await
        .expect_err("routes fail");
    let run_id = err
        .downcast_ref::<SyncError>()
        .and_then(SyncError::partial_summary)
        .map(|partial| partial.run_id)
        .expect("stage failure");

    let report_path = reports.join(run_id.to_string()).join("run_summary.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).expect("report")).expect("json");
    assert_eq!(report["stage"], "FAILED");
    assert_eq!(report["failure"]["attempted"], "ROUTES_SYNCED");
    assert_eq!(report["failure"]["completed"], "DIMENSIONS_SYNCED");
    assert!(report["failure"]["error"]
        .as_str()
        .is_some_and(|e| e.contains("unavailable")));
    assert_eq!(report["stations"]["inserted"], 2);
}

#[tokio::test]
async fn cancellation_without_reason_is_recorded_once() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI)];
    batch[1].cancelled = true;

    let first = pipeline.run_batch(&batch).await.expect("first run");
    assert_eq!(first.cancellations.inserted, 1);

    let replay = pipeline.run_batch(&batch).await.expect("replay");
    assert_eq!(replay.cancellations.inserted, 0);
    assert_eq!(replay.cancellations.unchanged, 1);
    assert_eq!(replay.total_writes(), 0);

    let cancellations = pipeline.store().cancellations().await;
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].reason, None);
}

#[tokio::test]
async fn unknown_station_skips_the_stop_and_its_cancellation() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut nowhere = pad_to_bri("G1", ("  ", "Unlisted Halt"));
    nowhere.cancelled = true;
    nowhere.cancel_reason = Some("Staff shortage".to_string());
    let batch = vec![pad_to_bri("G1", PAD), nowhere, pad_to_bri("G1", BRI)];

    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.stage, RunStage::Done);
    assert_eq!(summary.services.inserted, 1);
    assert_eq!(summary.stations.skipped, 1);
    assert_eq!(summary.stops.inserted, 2);
    assert_eq!(summary.stops.skipped, 1);
    assert_eq!(summary.cancellations.skipped, 1);
    assert_eq!(summary.cancellations.inserted, 0);
    assert!(pipeline.store().cancellations().await.is_empty());
}

#[tokio::test]
async fn repeated_stop_record_uses_the_first() {
    let pipeline = SyncPipeline::new(MemoryStore::new());
    let mut repeat = pad_to_bri("G1", PAD);
    repeat.platform = Some("9".to_string());
    repeat.cancelled = true;
    repeat.cancel_reason = Some("Fault".to_string());
    let batch = vec![pad_to_bri("G1", PAD), pad_to_bri("G1", BRI), repeat];

    let summary = pipeline.run_batch(&batch).await.expect("run");
    assert_eq!(summary.duplicate_stops, 1);
    assert_eq!(summary.stops.inserted, 2);
    assert_eq!(summary.cancellations.inserted, 0);

    let platforms = pipeline
        .store()
        .stops()
        .await
        .into_iter()
        .filter_map(|s| s.fields.platform)
        .collect::<Vec<_>>();
    assert_eq!(platforms, vec!["1".to_string(), "1".to_string()]);
}
