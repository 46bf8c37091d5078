// tests/engine_test.rs

//! End-to-end scenarios against [`AofEngine`] driven by the toy store in
//! `tests/common`, covering the fresh-start/round-trip/rewrite/backoff/
//! legacy-upgrade behaviors spec.md §8 calls out.

mod common;

use common::{ToyStore, argv};
use spineldb_aof::config::AofConfig;
use spineldb_aof::error::FatalPolicy;
use spineldb_aof::events::UnitOfWork;
use spineldb_aof::loader::LoadOutcome;
use spineldb_aof::{AofEngine, Dispatcher, ReplayContext, RewriteState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// A host applies a command to its live dataset and publishes the same
/// command to the engine in the same step; this helper does both, the way
/// the real dispatch path would.
fn apply_and_publish(engine: &AofEngine, store: &ToyStore, db_index: usize, words: &[&str]) {
    let cmd = argv(words);
    store.dispatch(&ReplayContext { db_index }, &cmd).unwrap();
    engine.publish(UnitOfWork::single(db_index, cmd));
}

fn fresh_config(dir: &std::path::Path) -> AofConfig {
    let mut config = AofConfig::default();
    config.dir = dir.to_path_buf();
    config.enabled = true;
    config
}

#[tokio::test]
async fn fresh_start_enable_and_rewrite_produces_base_and_incr() {
    let dir = tempdir().unwrap();
    let config = fresh_config(dir.path());
    let (engine, _aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let engine = Arc::new(engine);
    let store = Arc::new(ToyStore::new(16));

    let outcome = engine.load(store.as_ref(), None).await.unwrap();
    assert_eq!(outcome, LoadOutcome::NotExist);

    engine.enable().await.unwrap();
    let dataset: Arc<dyn spineldb_aof::DatasetSource> = store.clone();
    engine.trigger_rewrite(true, dataset).await.unwrap();

    let mut rewrite_done = engine.subscribe_rewrite_complete();
    tokio::time::timeout(Duration::from_secs(5), rewrite_done.changed())
        .await
        .expect("rewrite should complete")
        .unwrap();

    let status = engine.status().await;
    assert_eq!(status.state, RewriteState::On);
    assert!(status.file_count >= 2, "expected at least a BASE and an INCR file, got {}", status.file_count);
    assert!(config.manifest_path().exists());
}

#[tokio::test]
async fn writer_task_drains_published_work_and_survives_reload() {
    let dir = tempdir().unwrap();
    let config = fresh_config(dir.path());

    let (shutdown_tx, _rx) = tokio::sync::broadcast::channel(1);
    {
        let (engine, aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
        let engine = Arc::new(engine);
        let store = Arc::new(ToyStore::new(16));
        engine.load(store.as_ref(), None).await.unwrap();
        engine.enable().await.unwrap();
        let dataset: Arc<dyn spineldb_aof::DatasetSource> = store.clone();
        engine.trigger_rewrite(true, dataset).await.unwrap();
        let mut rewrite_done = engine.subscribe_rewrite_complete();
        tokio::time::timeout(Duration::from_secs(5), rewrite_done.changed())
            .await
            .unwrap()
            .unwrap();

        let writer_engine = engine.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let writer_task = tokio::spawn(writer_engine.run_writer_task(aof_rx, shutdown_rx));

        apply_and_publish(&engine, &store, 0, &["SET", "k1", "v1"]);
        apply_and_publish(&engine, &store, 0, &["SET", "k2", "v2"]);

        // Give the writer task a moment to drain and flush, then shut it down cleanly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        writer_task.await.unwrap();
    }

    let (engine2, _aof_rx2) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let store2 = ToyStore::new(16);
    let outcome = engine2.load(&store2, None).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded { .. }));
    assert_eq!(store2.get(0, "k1").as_deref(), Some("v1"));
    assert_eq!(store2.get(0, "k2").as_deref(), Some("v2"));
}

#[tokio::test]
async fn rewrite_during_writes_collapses_to_minimal_base_and_captures_interim_incr() {
    let dir = tempdir().unwrap();
    let config = fresh_config(dir.path());
    let (engine, aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let engine = Arc::new(engine);
    let store = Arc::new(ToyStore::new(16));
    engine.load(store.as_ref(), None).await.unwrap();
    engine.enable().await.unwrap();

    let dataset: Arc<dyn spineldb_aof::DatasetSource> = store.clone();
    engine.trigger_rewrite(true, dataset.clone()).await.unwrap();
    let mut rewrite_done = engine.subscribe_rewrite_complete();
    tokio::time::timeout(Duration::from_secs(5), rewrite_done.changed())
        .await
        .unwrap()
        .unwrap();

    let (shutdown_tx, _rx) = tokio::sync::broadcast::channel(1);
    let writer_engine = engine.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    let writer_task = tokio::spawn(writer_engine.run_writer_task(aof_rx, shutdown_rx));

    // First key lands before the dataset it's reconstructed from is captured.
    apply_and_publish(&engine, &store, 0, &["SET", "a", "1"]);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Second rewrite: the dataset now includes "a", so the new BASE should
    // reconstruct it directly and the old BASE is demoted to HISTORY.
    let status_before = engine.status().await;
    engine.trigger_rewrite(true, dataset).await.unwrap();
    let mut rewrite_done2 = engine.subscribe_rewrite_complete();
    tokio::time::timeout(Duration::from_secs(5), rewrite_done2.changed())
        .await
        .unwrap()
        .unwrap();

    apply_and_publish(&engine, &store, 0, &["SET", "b", "2"]);
    tokio::time::sleep(Duration::from_millis(30)).await;

    shutdown_tx.send(()).unwrap();
    writer_task.await.unwrap();

    let status_after = engine.status().await;
    assert_eq!(status_after.state, RewriteState::On);
    assert!(
        status_after.rewrite_base_size >= status_before.rewrite_base_size,
        "second rewrite's BASE should reflect the accumulated dataset, not shrink"
    );

    let (engine2, _rx2) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let store2 = ToyStore::new(16);
    engine2.load(&store2, None).await.unwrap();
    assert_eq!(store2.get(0, "a").as_deref(), Some("1"));
    assert_eq!(store2.get(0, "b").as_deref(), Some("2"));
}

#[tokio::test]
async fn rewrite_cannot_be_triggered_twice_concurrently() {
    let dir = tempdir().unwrap();
    let config = fresh_config(dir.path());
    let (engine, _aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let engine = Arc::new(engine);
    let store = Arc::new(ToyStore::new(16));
    engine.load(store.as_ref(), None).await.unwrap();
    engine.enable().await.unwrap();

    let dataset: Arc<dyn spineldb_aof::DatasetSource> = store.clone();
    engine.trigger_rewrite(true, dataset.clone()).await.unwrap();
    let second = engine.trigger_rewrite(true, dataset).await;
    assert!(second.is_err(), "a second rewrite while one is in flight must be rejected");

    let mut rewrite_done = engine.subscribe_rewrite_complete();
    tokio::time::timeout(Duration::from_secs(5), rewrite_done.changed())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn disable_requires_non_off_state_and_enable_requires_off() {
    let dir = tempdir().unwrap();
    let config = fresh_config(dir.path());
    let (engine, _aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let store = Arc::new(ToyStore::new(16));
    engine.load(store.as_ref(), None).await.unwrap();

    assert!(engine.disable().await.is_err(), "disable() on an already-OFF engine must error");
    engine.enable().await.unwrap();
    assert!(engine.enable().await.is_err(), "enable() while not OFF must error");
    engine.disable().await.unwrap();
}

#[tokio::test]
async fn legacy_single_file_aof_is_migrated_into_a_manifest_on_load() {
    let dir = tempdir().unwrap();
    let mut config = AofConfig::default();
    config.enabled = true;
    config.dir = dir.path().join("appendonlydir");

    // Simulate a pre-manifest deployment: a bare AOF file next to the directory.
    let legacy_path = dir.path().join(&config.filename);
    std::fs::write(&legacy_path, spineldb_aof::resp::encode_argv(&argv(&["SET", "legacy", "1"]))).unwrap();

    let (engine, _aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let store = ToyStore::new(16);
    let outcome = engine.load(&store, None).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded { commands_replayed: 1, .. }));
    assert_eq!(store.get(0, "legacy").as_deref(), Some("1"));
    assert!(config.manifest_path().exists());
    assert!(!legacy_path.exists(), "legacy file should have been moved into the AOF directory");
}

#[tokio::test]
async fn sweep_history_respects_disable_auto_gc() {
    let dir = tempdir().unwrap();
    let mut config = fresh_config(dir.path());
    config.disable_auto_gc = true;
    let (engine, _aof_rx) = AofEngine::configure(config.clone(), FatalPolicy::Propagate);
    let store = Arc::new(ToyStore::new(16));
    engine.load(store.as_ref(), None).await.unwrap();
    // No HISTORY entries exist yet; this just exercises that the guard short-circuits cleanly.
    engine.sweep_history().await;
}
