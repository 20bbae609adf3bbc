mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use hls_enrich::config::EngineConfig;
use hls_enrich::database;
use hls_enrich::pipeline::variants::TranscriptArtifacts;
use hls_enrich::pipeline::{
    MemoryPipelineStore, PipelineStore, PipelineWorker, SqlitePipelineStore, Stage, TaskSnapshot,
};
use hls_enrich::streams::MemoryStreamRegistry;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn worker_runs_segments_end_to_end() {
    let media = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let workdir = work.path().join("transcript");
    let store = Arc::new(MemoryPipelineStore::new());
    let engine = EngineConfig {
        retention: 2,
        ..fast_engine()
    };
    let h = transcript_task(&workdir, engine, store.clone());
    h.task.apply(None, enabled_transcript()).await.unwrap();

    let registry = Arc::new(MemoryStreamRegistry::new());
    registry.publish(stream("livestream", "2024-05-01T10:00:00Z"));
    let worker = PipelineWorker::new(h.task.clone(), registry.clone());
    worker.start().await.unwrap();

    // The selector elects the only published stream.
    let task = h.task.clone();
    assert!(eventually(WAIT, || !task.input().is_empty()).await);
    assert_eq!(h.task.input(), "rtmp://localhost/live/livestream");

    let mut other = hls_message(media.path(), 99).await;
    other.stream = "other".to_string();
    assert!(!h.task.on_hls_segment(other));

    let msg = hls_message(media.path(), 1).await;
    let source = PathBuf::from(&msg.file);
    assert!(h.task.on_hls_segment(msg.clone()));

    let task = h.task.clone();
    assert!(eventually(WAIT, || task.queue(Stage::Final).count() == 1).await);

    let segment = h.task.segments(Stage::Final).remove(0);
    assert!(segment.id().starts_with("1-org-"));
    assert_eq!(segment.msg, msg);
    assert_eq!(segment.ts_file.duration, 6.0);
    assert_eq!(segment.ts_file.size, "segment 1".len() as u64);
    assert!(segment.ts_file.path.starts_with(&workdir));
    assert!(!segment.ingest_cost.is_zero());
    assert!(!segment.artifacts.extract_cost.is_zero());
    assert!(!segment.artifacts.asr_cost.is_zero());
    assert!(!segment.artifacts.overlay_cost.is_zero());
    assert!(source.exists(), "the media server's file is left alone");

    let first_files: Vec<PathBuf> = segment.files().iter().map(|p| p.to_path_buf()).collect();
    assert!(h.task.on_hls_segment(hls_message(media.path(), 2).await));
    let task = h.task.clone();
    assert!(eventually(WAIT, || task.queue(Stage::Final).count() == 2).await);
    assert!(first_files.iter().all(|p| p.exists()));

    // A third final segment pushes the oldest out.
    assert!(h.task.on_hls_segment(hls_message(media.path(), 3).await));
    let task = h.task.clone();
    assert!(
        eventually(WAIT, || {
            let finished = task.segments(Stage::Final);
            finished.len() == 2 && finished[0].ts_file.seqno == 2
        })
        .await
    );
    assert!(first_files.iter().all(|p| !p.exists()));

    worker.stop().await;
    assert!(!worker.is_running());

    let stored = store.load_tasks("transcript").await.unwrap();
    assert_eq!(stored.len(), 1);
    let snapshot: TaskSnapshot<TranscriptArtifacts> =
        serde_json::from_str(&stored[0].snapshot).unwrap();
    assert_eq!(snapshot.uuid, h.task.uuid());
    assert_eq!(snapshot.finished.len(), 2);
    assert_eq!(snapshot.input, "rtmp://localhost/live/livestream");
}

#[tokio::test]
async fn worker_follows_the_newest_stream() {
    let work = TempDir::new().unwrap();
    let h = transcript_task(work.path(), fast_engine(), Arc::new(MemoryPipelineStore::new()));
    h.task.apply(None, enabled_transcript()).await.unwrap();

    let registry = Arc::new(MemoryStreamRegistry::new());
    registry.publish(stream("first", "2024-05-01T10:00:00Z"));
    let worker = PipelineWorker::new(h.task.clone(), registry.clone());
    worker.start().await.unwrap();

    let task = h.task.clone();
    assert!(eventually(WAIT, || task.input().ends_with("/first")).await);

    registry.publish(stream("second", "2024-05-01T10:00:30Z"));
    let task = h.task.clone();
    assert!(eventually(WAIT, || task.input().ends_with("/second")).await);

    worker.stop().await;
}

#[tokio::test]
async fn worker_restores_stored_task() {
    let work = TempDir::new().unwrap();
    let store = Arc::new(MemoryPipelineStore::new());

    let first = transcript_task(work.path(), fast_engine(), store.clone());
    let config = hls_enrich::pipeline::variants::TranscriptConfig {
        fix_window_secs: 3600,
        ..enabled_transcript()
    };
    first.task.apply(None, config).await.unwrap();
    ingest(&first.task, 1).await;
    first.task.save().await.unwrap();

    let second = transcript_task(work.path(), fast_engine(), store);
    let worker = PipelineWorker::new(second.task.clone(), Arc::new(MemoryStreamRegistry::new()));
    worker.start().await.unwrap();
    assert_eq!(second.task.uuid(), first.task.uuid());

    // The fix window holds the segment in the fix queue.
    let task = second.task.clone();
    assert!(eventually(WAIT, || task.queue(Stage::Render).count() == 1).await);
    assert!(worker.start().await.is_err());

    worker.stop().await;
}

#[tokio::test]
async fn persistence_requests_coalesce() {
    let work = TempDir::new().unwrap();
    let store = Arc::new(RecordingStore::default());
    let task = transcript_task_with_store(
        work.path(),
        Arc::new(FakeSpeech::default()),
        store.clone(),
    );
    for _ in 0..50 {
        task.notify_persistence();
    }

    let worker = PipelineWorker::new(task.clone(), Arc::new(MemoryStreamRegistry::new()));
    worker.start().await.unwrap();
    let saves = store.clone();
    assert!(eventually(WAIT, || saves.saves.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);

    worker.stop().await;
    // One more on shutdown.
    assert_eq!(store.saves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sqlite_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pipeline.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    let store = Arc::new(SqlitePipelineStore::new(pool.clone()));

    let work = TempDir::new().unwrap();
    let h = {
        let transcoder = Arc::new(FakeTranscoder::default());
        let speech = Arc::new(FakeSpeech::default());
        Arc::new(hls_enrich::pipeline::PipelineTask::new(
            hls_enrich::pipeline::variants::TranscriptPipeline::new(transcoder, speech),
            fast_engine(),
            work.path(),
            store.clone(),
        ))
    };
    h.apply(None, enabled_transcript()).await.unwrap();
    ingest(&h, 1).await;
    h.drive(Stage::Live).await.unwrap();
    h.save().await.unwrap();
    let before = serde_json::to_value(h.snapshot()).unwrap();
    pool.close().await;

    let pool = database::init_pool(&db_url).await.unwrap();
    let store = Arc::new(SqlitePipelineStore::new(pool));
    let restored = Arc::new(hls_enrich::pipeline::PipelineTask::new(
        hls_enrich::pipeline::variants::TranscriptPipeline::new(
            Arc::new(FakeTranscoder::default()),
            Arc::new(FakeSpeech::default()),
        ),
        fast_engine(),
        work.path(),
        store.clone(),
    ));
    assert!(restored.load_persisted().await.unwrap());
    assert_eq!(serde_json::to_value(restored.snapshot()).unwrap(), before);
    assert!(restored.reload_config().await.unwrap().enabled);
    assert!(store.load_config("transcript").await.unwrap().is_some());
}
