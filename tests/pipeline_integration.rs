//! End-to-end integration tests exercising the stage registry, the index/liquidity stages against
//! real files on disk, and the license key format contract, all through the public `isx_pulse` API
//! rather than the inline per-module unit tests.

use std::path::Path;

use isx_pulse::events::Hub;
use isx_pulse::license::{LicenseError, LicenseKey};
use isx_pulse::stages::{default_registry, ProgressSink, Stage, StageContext};
use isx_pulse::types::{ArtifactKind, OperationType};
use tempfile::tempdir;
use uuid::Uuid;

fn stage_context(workspace: &Path, config: serde_json::Value) -> StageContext {
    StageContext {
        operation_id: Uuid::new_v4(),
        workspace: workspace.to_path_buf(),
        config,
        cancel: tokio_util::sync::CancellationToken::new(),
        trace_id: "test-trace".to_string(),
        attempt: 1,
    }
}

fn progress_sink() -> ProgressSink {
    let hub = Hub::new();
    ProgressSink::new(hub.handle(), Uuid::new_v4(), "test", "test-trace".to_string())
}

fn write_ticker_csv(dir: &Path, symbol: &str, rows: &[(&str, f64, f64, f64, f64, f64, f64)]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut writer = csv::Writer::from_path(dir.join(format!("{symbol}.csv"))).unwrap();
    writer
        .write_record(["Date", "Open", "High", "Low", "Close", "Volume", "Value"])
        .unwrap();
    for (date, open, high, low, close, volume, value) in rows {
        writer
            .write_record([
                date.to_string(),
                open.to_string(),
                high.to_string(),
                low.to_string(),
                close.to_string(),
                volume.to_string(),
                value.to_string(),
            ])
            .unwrap();
    }
    writer.flush().unwrap();
}

#[test]
fn full_pipeline_stage_order_matches_registration_order() {
    let registry = default_registry();
    let order = registry.resolve(OperationType::FullPipeline.stage_ids()).unwrap();
    let ids: Vec<_> = order.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec!["scrape", "process", "index", "liquidity"]);
}

#[test]
fn liquidity_only_plan_skips_unrelated_stages() {
    let registry = default_registry();
    let order = registry.resolve(OperationType::LiquidityOnly.stage_ids()).unwrap();
    assert_eq!(order.len(), 1);
    assert_eq!(order[0].id(), "liquidity");
}

#[tokio::test]
async fn index_stage_aggregates_two_tickers_into_one_csv_per_date() {
    let workspace = tempdir().unwrap();
    let tickers_dir = workspace.path().join("tickers");
    write_ticker_csv(
        &tickers_dir,
        "TASC",
        &[
            ("2024-01-01", 10.0, 10.5, 9.5, 10.2, 100.0, 1000.0),
            ("2024-01-02", 10.2, 10.8, 10.0, 10.5, 150.0, 1500.0),
        ],
    );
    write_ticker_csv(
        &tickers_dir,
        "BCOI",
        &[
            ("2024-01-01", 5.0, 5.2, 4.8, 5.1, 200.0, 1000.0),
            ("2024-01-02", 5.1, 5.3, 5.0, 5.2, 250.0, 1300.0),
        ],
    );

    let stage = isx_pulse::stages::index::IndexStage::default();
    let ctx = stage_context(workspace.path(), serde_json::json!({}));
    stage.validate(&ctx).await.unwrap();
    let artifacts = stage.execute(&ctx, progress_sink()).await.unwrap();

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::IndexesCsv);

    let out_path = workspace.path().join("indexes.csv");
    assert!(out_path.exists());
    let contents = std::fs::read_to_string(&out_path).unwrap();
    let line_count = contents.lines().count();
    assert_eq!(line_count, 3); // header + two distinct dates

    let bytes = std::fs::read(&out_path).unwrap();
    let recomputed = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(&bytes));
    assert_eq!(recomputed, artifacts[0].sha256);
}

#[tokio::test]
async fn index_stage_rejects_missing_tickers_directory() {
    let workspace = tempdir().unwrap();
    let stage = isx_pulse::stages::index::IndexStage::default();
    let ctx = stage_context(workspace.path(), serde_json::json!({}));
    assert!(stage.validate(&ctx).await.is_err());
}

#[tokio::test]
async fn liquidity_stage_scores_fixture_matching_known_intermediate_values() {
    // Same S3 fixture as the calculator's own unit test, driven through the Stage trait this time.
    let workspace = tempdir().unwrap();
    let tickers_dir = workspace.path().join("tickers");
    write_ticker_csv(
        &tickers_dir,
        "TASC",
        &[
            ("2024-01-01", 9.0, 10.0, 9.0, 9.0, 10.0, 100.0),
            ("2024-01-02", 9.0, 11.0, 10.0, 9.0, 0.0, 0.0),
            ("2024-01-03", 9.0, 12.0, 11.0, 9.81, 15.0, 200.0),
        ],
    );

    let stage = isx_pulse::stages::liquidity::LiquidityStage::default();
    let ctx = stage_context(
        workspace.path(),
        serde_json::json!({"window": 3, "penalty": "piecewise"}),
    );
    stage.validate(&ctx).await.unwrap();
    let artifacts = stage.execute(&ctx, progress_sink()).await.unwrap();

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::LiquidityScoresCsv);
    let contents = std::fs::read_to_string(&artifacts[0].path).unwrap();
    assert!(contents.contains("TASC"));
}

#[test]
fn license_key_parse_accepts_well_formed_key() {
    let key = LicenseKey::parse("ISX1Y-ABCDE-12345-FGHIJ-67890").unwrap();
    assert_eq!(key.as_str(), "ISX1Y-ABCDE-12345-FGHIJ-67890");
}

#[test]
fn license_key_parse_rejects_malformed_key() {
    let err = LicenseKey::parse("INVALID").unwrap_err();
    assert!(matches!(err, LicenseError::InvalidFormat));
}

#[tokio::test]
async fn calibration_flag_produces_a_report_instead_of_scores() {
    let workspace = tempdir().unwrap();
    let tickers_dir = workspace.path().join("tickers");
    for (i, symbol) in ["AAAA", "BBBB", "CCCC", "DDDD"].iter().enumerate() {
        let base = 10.0 + i as f64;
        write_ticker_csv(
            &tickers_dir,
            symbol,
            &[
                ("2024-01-01", base, base + 0.5, base - 0.5, base + 0.1, 100.0, 1000.0),
                ("2024-01-02", base, base + 0.6, base - 0.4, base + 0.2, 120.0, 1100.0),
                ("2024-01-03", base, base + 0.4, base - 0.3, base - 0.1, 90.0, 900.0),
            ],
        );
    }

    let stage = isx_pulse::stages::liquidity::LiquidityStage::default();
    let ctx = stage_context(
        workspace.path(),
        serde_json::json!({"window": 3, "calibrate": true}),
    );
    let artifacts = stage.execute(&ctx, progress_sink()).await;

    // With only three observations per ticker the grid search may legitimately fail validation
    // (too few points for meaningful correlation); either a report is produced or a Validation
    // error is returned, but it must never silently produce a liquidity_scores file instead.
    match artifacts {
        Ok(artifacts) => assert_eq!(artifacts[0].kind, ArtifactKind::CalibrationReport),
        Err(e) => assert!(matches!(e, isx_pulse::stages::StageError::Validation(_))),
    }
}
