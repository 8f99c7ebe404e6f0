//! Engine tests against the SQLite stores.

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use field_cache::config::Config;
use field_cache::import::import_rows;
use field_cache::migrate::run_migrations;
use field_cache::recommend::DisabledRecommender;
use field_cache::service::EnrichmentService;
use field_cache::sqlite_store::sqlite_stores;
use field_cache::db;
use field_cache_core::models::Layer;
use field_cache_core::progress::NoProgress;
use field_cache_core::store::{ClearScope, RowStore};

fn sheet(data_rows: usize) -> Vec<Vec<Value>> {
    let mut rows = vec![
        vec![json!("Case_Organization"), json!(""), json!("Monitor_Vital_Signs")],
        vec![json!("Case_ID"), json!("Spark_Title"), json!("Initial_Vitals")],
    ];
    for i in 0..data_rows {
        rows.push(vec![
            json!(format!("CASE-{:04}", i + 1)),
            json!(format!("Title {}", i + 1)),
            json!("{\"hr\": 72, \"spo2\": 99}"),
        ]);
    }
    rows
}

async fn setup(data_rows: usize) -> (TempDir, Config, EnrichmentService) {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}/fcache.sqlite\"\n",
        tmp.path().display()
    ))
    .unwrap();
    run_migrations(&config).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    import_rows(&pool, &sheet(data_rows)).await.unwrap();
    let service = EnrichmentService::with_stores(
        config.clone(),
        sqlite_stores(&pool),
        Arc::new(DisabledRecommender),
    );
    (tmp, config, service)
}

async fn reopen(config: &Config) -> EnrichmentService {
    let pool = db::connect(config).await.unwrap();
    EnrichmentService::with_stores(config.clone(), sqlite_stores(&pool), Arc::new(DisabledRecommender))
}

#[tokio::test]
async fn test_thirty_rows_in_batches_of_twenty_five() {
    let (_tmp, _config, svc) = setup(30).await;

    let first = svc.run(&Layer::ALL, Some(25), Arc::new(NoProgress)).await.unwrap();
    assert_eq!(first, 25);
    let status = svc.status().await.unwrap();
    assert_eq!(status.data_rows, 30);
    assert_eq!(status.cursors[0].position, 27);

    let second = svc.run(&Layer::ALL, Some(25), Arc::new(NoProgress)).await.unwrap();
    assert_eq!(second, 5);
    assert_eq!(svc.status().await.unwrap().cursors[0].position, 32);

    let third = svc.run(&Layer::ALL, Some(25), Arc::new(NoProgress)).await.unwrap();
    assert_eq!(third, 0);

    for layer in svc.status().await.unwrap().layers {
        assert_eq!(layer.rows, 30, "layer {}", layer.layer);
        assert_eq!(layer.percent, 100);
    }
}

#[tokio::test]
async fn test_cursor_survives_reopen() {
    let (_tmp, config, svc) = setup(6).await;
    svc.run(&[Layer::Vitals], Some(4), Arc::new(NoProgress)).await.unwrap();
    drop(svc);

    let svc = reopen(&config).await;
    let mut job = svc.job(&[Layer::Vitals], None, Arc::new(NoProgress)).await.unwrap();
    let out = job.step().await.unwrap();
    assert_eq!(out.row, Some(7));
    assert_eq!(job.run().await.unwrap(), 2);
}

#[tokio::test]
async fn test_layer_sets_keep_separate_cursors() {
    let (_tmp, _config, svc) = setup(5).await;
    svc.run(&[Layer::Basic], Some(2), Arc::new(NoProgress)).await.unwrap();
    svc.run(&[Layer::Vitals, Layer::Basic], Some(3), Arc::new(NoProgress)).await.unwrap();

    let cursors = svc.status().await.unwrap().cursors;
    assert_eq!(cursors.len(), 2);
    let basic = cursors.iter().find(|c| c.layers == "basic").unwrap();
    let pair = cursors.iter().find(|c| c.layers == "basic,vitals").unwrap();
    assert_eq!(basic.position, 4);
    assert_eq!(pair.position, 5);
}

#[tokio::test]
async fn test_second_operator_cannot_double_commit() {
    let (_tmp, config, a) = setup(3).await;
    let b = reopen(&config).await;

    let mut job_a = a.job(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap();
    let mut job_b = b.job(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap();

    // A fetches 3..=5 and commits 3; B then fetches 4..=5 and commits 4.
    assert_eq!(job_a.step().await.unwrap().row, Some(3));
    assert_eq!(job_b.step().await.unwrap().row, Some(4));

    // A still holds row 4 from its stale batch.
    let err = job_a.step().await.unwrap_err();
    assert_eq!(err.row, 4);
    assert!(err.layer.is_none());

    assert_eq!(b.status().await.unwrap().cursors[0].position, 4);
}

#[tokio::test]
async fn test_clear_layer_resets_cursors_and_merge_reports_missing() {
    let (_tmp, _config, svc) = setup(2).await;
    svc.run(&Layer::ALL, None, Arc::new(NoProgress)).await.unwrap();

    let summary = svc.clear(ClearScope::Layer(Layer::Vitals)).await.unwrap();
    assert_eq!(summary.entries_removed, 2);
    assert_eq!(summary.cursors_reset, 1);
    assert!(svc.status().await.unwrap().cursors.is_empty());

    let doc = svc.merge(3).await.unwrap();
    assert_eq!(doc.missing, vec![Layer::Vitals]);
    assert_eq!(doc.case_id.as_deref(), Some("CASE-0001"));
    assert!(!doc.fields.contains_key("vitals.initialHr"));

    // Re-running recomputes only the cleared layer.
    let mut job = svc.job(&Layer::ALL, Some(1), Arc::new(NoProgress)).await.unwrap();
    let out = job.step().await.unwrap();
    assert_eq!(out.computed, vec![Layer::Vitals]);
    assert_eq!(out.skipped.len(), Layer::ALL.len() - 1);
}

#[tokio::test]
async fn test_merge_reads_vitals_and_flags_selection_change() {
    let (_tmp, _config, svc) = setup(1).await;
    svc.run(&Layer::ALL, None, Arc::new(NoProgress)).await.unwrap();

    let doc = svc.merge(3).await.unwrap();
    assert!(!doc.stale);
    assert!(doc.missing.is_empty());
    assert_eq!(doc.fields["vitals.initialHr"], json!(72));
    assert_eq!(doc.fields["vitals.initialSpo2"], json!(99));
    assert_eq!(doc.fields["vitals.initialBpSys"], Value::Null);

    svc.select_fields(&["Case_Organization_Spark_Title".to_string()])
        .await
        .unwrap();
    let doc = svc.merge(3).await.unwrap();
    assert!(doc.stale);
    assert!(doc.layers.iter().all(|s| s.selection_changed));
}

#[tokio::test]
async fn test_missing_case_id_is_generated_and_written_back() {
    let (_tmp, config, svc) = setup(1).await;
    let pool = db::connect(&config).await.unwrap();
    let mut rows = sheet(1);
    rows[2][0] = json!("");
    import_rows(&pool, &rows).await.unwrap();

    svc.run(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap();
    let doc = svc.merge(3).await.unwrap();
    let id = doc.case_id.expect("case id generated");
    assert!(id.starts_with("CASE-"));
    assert_eq!(id.len(), "CASE-".len() + 8);

    let cell = svc.stores().rows.get_row(3).await.unwrap()[0].clone();
    assert_eq!(cell, json!(id));
}

#[tokio::test]
async fn test_reimport_truncates_extra_rows() {
    let (_tmp, config, svc) = setup(5).await;
    let pool = db::connect(&config).await.unwrap();
    let summary = import_rows(&pool, &sheet(2)).await.unwrap();
    assert_eq!(summary.data_rows, 2);
    assert_eq!(summary.removed, 3);
    assert_eq!(summary.invalidated_from, Some(5));
    assert_eq!(svc.status().await.unwrap().data_rows, 2);
}

#[tokio::test]
async fn test_reimport_with_new_content_is_enriched_again() {
    let (_tmp, config, svc) = setup(5).await;
    assert_eq!(svc.run(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap(), 5);

    let pool = db::connect(&config).await.unwrap();
    import_rows(&pool, &sheet(2)).await.unwrap();
    let mut rows = sheet(5);
    for row in rows.iter_mut().skip(2) {
        row[1] = json!(format!("New {}", row[1].as_str().unwrap()));
    }
    let summary = import_rows(&pool, &rows).await.unwrap();
    assert_eq!(summary.invalidated_from, Some(3));
    assert_eq!(summary.cursors_reset, 0);
    assert!(svc.status().await.unwrap().cursors.is_empty());

    assert_eq!(svc.run(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap(), 5);
    let doc = svc.merge(6).await.unwrap();
    assert_eq!(doc.fields["basic.sparkTitle"], json!("New Title 4"));
    assert!(!doc.stale);
}

#[tokio::test]
async fn test_appending_rows_keeps_progress() {
    let (_tmp, config, svc) = setup(3).await;
    svc.run(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let summary = import_rows(&pool, &sheet(5)).await.unwrap();
    assert_eq!(summary.invalidated_from, None);
    assert_eq!(svc.status().await.unwrap().cursors[0].position, 5);
    assert_eq!(svc.run(&[Layer::Basic], None, Arc::new(NoProgress)).await.unwrap(), 2);
}
