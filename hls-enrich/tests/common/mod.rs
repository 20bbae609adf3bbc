#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hls_enrich::callback::{CallbackSink, OcrEvent};
use hls_enrich::config::EngineConfig;
use hls_enrich::inference::{
    AiProvider, AsrResult, AsrSegment, SpeechRecognizer, TranscriptionRequest, VisionRecognizer,
    VisionRequest,
};
use hls_enrich::media::{ActiveStream, HlsMessage, Transcoder, TsFile};
use hls_enrich::pipeline::task::IngestedSegment;
use hls_enrich::pipeline::variants::{OcrPipeline, TranscriptConfig, TranscriptPipeline};
use hls_enrich::pipeline::{
    MemoryPipelineStore, PipelineStore, PipelineTask, PipelineVariant, StoredTask,
};
use hls_enrich::{Error, Result};
use parking_lot::Mutex;

/// Engine timings small enough for tests.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        tick_ms: 10,
        error_backoff_ms: 50,
        retention_idle_ms: 10,
        selector_idle_ms: 20,
        reset_grace_ms: 20,
        run_interval_ms: 10,
        run_backoff_ms: 50,
        ..EngineConfig::default()
    }
}

/// Writes small real files instead of running ffmpeg.
#[derive(Default)]
pub struct FakeTranscoder {
    pub fail_audio: AtomicBool,
    /// Subtitle documents passed to burn-in, `None` when no filter was used.
    pub subtitles: Mutex<Vec<Option<String>>>,
}

async fn write_after_delay(output: &Path, contents: &[u8]) -> Result<()> {
    tokio::time::sleep(Duration::from_millis(2)).await;
    tokio::fs::write(output, contents).await?;
    Ok(())
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn extract_audio(&self, _input: &Path, output: &Path) -> Result<()> {
        if self.fail_audio.load(Ordering::SeqCst) {
            return Err(Error::transcode("audio extraction failed"));
        }
        write_after_delay(output, b"audio").await
    }

    async fn extract_frame(&self, _input: &Path, output: &Path) -> Result<()> {
        write_after_delay(output, b"jpeg").await
    }

    async fn burn_subtitles(
        &self,
        input: &Path,
        subtitles: Option<&Path>,
        output: &Path,
    ) -> Result<()> {
        let srt = match subtitles {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        self.subtitles.lock().push(srt);
        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn probe_start_time(&self, _input: &Path) -> Result<f64> {
        Ok(1.5)
    }
}

/// Answers `text {n}` for the n-th call and records the prompts it was given.
#[derive(Default)]
pub struct FakeSpeech {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechRecognizer for FakeSpeech {
    async fn transcribe(
        &self,
        _provider: &AiProvider,
        request: TranscriptionRequest<'_>,
    ) -> Result<AsrResult> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().push(request.prompt.to_string());
        let text = format!("text {}", n);
        Ok(AsrResult {
            task: "transcribe".to_string(),
            language: "en".to_string(),
            duration: 6.0,
            text: text.clone(),
            segments: vec![AsrSegment {
                id: 0,
                seek: 0,
                start: 0.0,
                end: 5.5,
                text,
            }],
        })
    }
}

/// Replies with a fixed text and records the history length of each call.
pub struct FakeVision {
    pub reply: Mutex<String>,
    pub history_lens: Mutex<Vec<usize>>,
}

impl FakeVision {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(reply.to_string()),
            history_lens: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VisionRecognizer for FakeVision {
    async fn recognize(&self, _provider: &AiProvider, request: VisionRequest<'_>) -> Result<String> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.history_lens.lock().push(request.history.len());
        Ok(self.reply.lock().clone())
    }
}

#[derive(Default)]
pub struct RecordingCallback {
    pub fail: AtomicBool,
    pub events: Mutex<Vec<OcrEvent>>,
}

#[async_trait]
impl CallbackSink for RecordingCallback {
    async fn on_ocr(&self, event: &OcrEvent) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.events.lock().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Other("callback refused".to_string()));
        }
        Ok(())
    }
}

/// In-memory store that counts snapshot writes and can slow them down.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryPipelineStore,
    pub save_delay: Duration,
    pub saves: AtomicUsize,
}

impl RecordingStore {
    pub fn slow(save_delay: Duration) -> Self {
        Self {
            save_delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PipelineStore for RecordingStore {
    async fn load_tasks(&self, kind: &str) -> Result<Vec<StoredTask>> {
        self.inner.load_tasks(kind).await
    }

    async fn save_task(&self, kind: &str, uuid: &str, snapshot: &str) -> Result<()> {
        tokio::time::sleep(self.save_delay).await;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_task(kind, uuid, snapshot).await
    }

    async fn delete_task(&self, kind: &str, uuid: &str) -> Result<()> {
        self.inner.delete_task(kind, uuid).await
    }

    async fn delete_tasks(&self, kind: &str) -> Result<()> {
        self.inner.delete_tasks(kind).await
    }

    async fn load_config(&self, kind: &str) -> Result<Option<String>> {
        self.inner.load_config(kind).await
    }

    async fn save_config(&self, kind: &str, config: &str) -> Result<()> {
        self.inner.save_config(kind, config).await
    }
}

/// Transcript task over fake media and speech backed by any store.
pub fn transcript_task_with_store(
    workdir: &Path,
    speech: Arc<dyn SpeechRecognizer>,
    store: Arc<dyn PipelineStore>,
) -> Arc<PipelineTask<TranscriptPipeline>> {
    Arc::new(PipelineTask::new(
        TranscriptPipeline::new(Arc::new(FakeTranscoder::default()), speech),
        fast_engine(),
        workdir,
        store,
    ))
}

pub struct TranscriptHarness {
    pub task: Arc<PipelineTask<TranscriptPipeline>>,
    pub transcoder: Arc<FakeTranscoder>,
    pub speech: Arc<FakeSpeech>,
    pub store: Arc<MemoryPipelineStore>,
}

pub fn transcript_task(
    workdir: &Path,
    engine: EngineConfig,
    store: Arc<MemoryPipelineStore>,
) -> TranscriptHarness {
    let transcoder = Arc::new(FakeTranscoder::default());
    let speech = Arc::new(FakeSpeech::default());
    let task = Arc::new(PipelineTask::new(
        TranscriptPipeline::new(transcoder.clone(), speech.clone()),
        engine,
        workdir,
        store.clone() as Arc<dyn PipelineStore>,
    ));
    TranscriptHarness {
        task,
        transcoder,
        speech,
        store,
    }
}

pub struct OcrHarness {
    pub task: Arc<PipelineTask<OcrPipeline>>,
    pub vision: Arc<FakeVision>,
    pub callback: Arc<RecordingCallback>,
}

pub fn ocr_task(workdir: &Path, engine: EngineConfig, reply: &str) -> OcrHarness {
    let vision = Arc::new(FakeVision::replying(reply));
    let callback = Arc::new(RecordingCallback::default());
    let task = Arc::new(PipelineTask::new(
        OcrPipeline::new(Arc::new(FakeTranscoder::default()), vision.clone(), callback.clone()),
        engine,
        workdir,
        Arc::new(MemoryPipelineStore::new()),
    ));
    OcrHarness {
        task,
        vision,
        callback,
    }
}

pub fn enabled_transcript() -> TranscriptConfig {
    TranscriptConfig {
        enabled: true,
        language: "en".to_string(),
        ..TranscriptConfig::default()
    }
}

pub fn stream(name: &str, update: &str) -> ActiveStream {
    ActiveStream {
        vhost: "__defaultVhost__".to_string(),
        app: "live".to_string(),
        stream: name.to_string(),
        param: String::new(),
        server_id: "vid-1".to_string(),
        client_id: format!("client-{}", name),
        update: update.to_string(),
    }
}

/// Notification for segment `seq` of `live/livestream`, written by the media
/// server to `dir`.
pub async fn hls_message(dir: &Path, seq: u64) -> HlsMessage {
    let file = dir.join(format!("livestream-{}.ts", seq));
    tokio::fs::write(&file, format!("segment {}", seq)).await.unwrap();
    HlsMessage {
        action: "on_hls".to_string(),
        vhost: "__defaultVhost__".to_string(),
        app: "live".to_string(),
        stream: "livestream".to_string(),
        duration: 6.0,
        file: file.to_string_lossy().into_owned(),
        url: format!("live/livestream-{}.ts", seq),
        m3u8_url: "live/livestream.m3u8".to_string(),
        seq_no: seq,
        ..HlsMessage::default()
    }
}

/// Place segment `seq` in the live queue as if it had been copied in.
pub async fn ingest<V: PipelineVariant>(task: &PipelineTask<V>, seq: u64) -> String {
    let tsid = format!("{}-org-test", seq);
    let path: PathBuf = task.workdir().join(format!("{}.ts", tsid));
    tokio::fs::write(&path, format!("segment {}", seq)).await.unwrap();
    let msg = HlsMessage {
        app: "live".to_string(),
        stream: "livestream".to_string(),
        duration: 6.0,
        seq_no: seq,
        ..HlsMessage::default()
    };
    let ts_file = TsFile {
        tsid: tsid.clone(),
        path,
        url: format!("live/livestream-{}.ts", seq),
        seqno: seq,
        duration: 6.0,
        size: 9,
    };
    task.accept_segment(IngestedSegment {
        msg,
        ts_file,
        cost: Duration::from_millis(1),
    })
    .await;
    tsid
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
