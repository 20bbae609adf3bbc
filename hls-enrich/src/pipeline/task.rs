//! The pipeline task: four stage queues, the elected input and the controls
//! around them.

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::StageQueue;
use super::segment::{Artifacts, Segment, Stage, cost_since};
use super::snapshot::{DeadLetter, TaskSnapshot};
use super::store::PipelineStore;
use super::variant::{PipelineVariant, StageContext, StageOutput, VariantConfig};
use crate::config::EngineConfig;
use crate::inference::ChatMessage;
use crate::media::{self, ActiveStream, HlsMessage, TsFile};
use crate::streams::StreamRegistry;
use crate::utils::fs;
use crate::{Error, Result};

/// Capacity of the channel between the ingestion copies and the consumer.
const INGEST_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of one driver pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A segment moved, was evicted or was dropped.
    Busy,
    /// Nothing to do, or held back by backpressure or a gate.
    Idle,
}

/// A segment copied into the working directory, waiting to be enqueued.
#[derive(Debug)]
pub struct IngestedSegment {
    pub msg: HlsMessage,
    pub ts_file: TsFile,
    pub cost: Duration,
}

/// Receiving ends of the task's signal channels, owned by the worker.
pub struct TaskReceivers {
    pub persistence: mpsc::Receiver<()>,
    pub new_stream: mpsc::Receiver<ActiveStream>,
    pub ingest: mpsc::Receiver<IngestedSegment>,
}

struct TaskState<C> {
    uuid: String,
    input: String,
    input_stream: Option<ActiveStream>,
    history: Vec<ChatMessage>,
    config: C,
    dead_letters: VecDeque<DeadLetter>,
}

/// Pick the most recently updated stream.
///
/// Equal update times go to the lexicographically smallest stream key.
pub fn elect_stream(streams: &[ActiveStream]) -> Result<Option<&ActiveStream>> {
    let mut best: Option<(&ActiveStream, DateTime<FixedOffset>, String)> = None;
    for stream in streams {
        let update = stream.update_time()?;
        let key = stream.stream_url();
        let better = match &best {
            None => true,
            Some((_, best_update, best_key)) => {
                update > *best_update || (update == *best_update && key < *best_key)
            }
        };
        if better {
            best = Some((stream, update, key));
        }
    }
    Ok(best.map(|(stream, _, _)| stream))
}

fn trim_history(history: &mut Vec<ChatMessage>, window: usize) {
    if history.len() > window {
        let excess = history.len() - window;
        history.drain(..excess);
    }
}

/// One pipeline instance.
///
/// Constructed once by the composition root and shared by `Arc` with the
/// worker loops and the hooks that feed it.
pub struct PipelineTask<V: PipelineVariant> {
    variant: V,
    engine: EngineConfig,
    workdir: PathBuf,
    store: Arc<dyn PipelineStore>,
    state: Mutex<TaskState<V::Config>>,
    queues: [StageQueue<V::Artifacts>; 4],
    /// Shared while a segment moves between queues, exclusive while the
    /// queues are read or replaced as a whole.
    transfer: RwLock<()>,
    /// Orders snapshot writes against the UUID swap of a reset.
    persist: tokio::sync::Mutex<()>,
    persistence_tx: mpsc::Sender<()>,
    new_stream_tx: mpsc::Sender<ActiveStream>,
    ingest_tx: mpsc::Sender<IngestedSegment>,
    receivers: Mutex<Option<TaskReceivers>>,
    cancel: CancellationToken,
    /// Token of the running control loop, cancelled by restart.
    run_token: Mutex<Option<CancellationToken>>,
}

impl<V: PipelineVariant> PipelineTask<V> {
    pub fn new(
        variant: V,
        engine: EngineConfig,
        workdir: impl Into<PathBuf>,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        let (persistence_tx, persistence) = mpsc::channel(1);
        let (new_stream_tx, new_stream) = mpsc::channel(1);
        let (ingest_tx, ingest) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

        Self {
            variant,
            engine,
            workdir: workdir.into(),
            store,
            state: Mutex::new(TaskState {
                uuid: Uuid::new_v4().to_string(),
                input: String::new(),
                input_stream: None,
                history: Vec::new(),
                config: V::Config::default(),
                dead_letters: VecDeque::new(),
            }),
            queues: V::QUEUE_NAMES.map(StageQueue::new),
            transfer: RwLock::new(()),
            persist: tokio::sync::Mutex::new(()),
            persistence_tx,
            new_stream_tx,
            ingest_tx,
            receivers: Mutex::new(Some(TaskReceivers {
                persistence,
                new_stream,
                ingest,
            })),
            cancel: CancellationToken::new(),
            run_token: Mutex::new(None),
        }
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn uuid(&self) -> String {
        self.state.lock().uuid.clone()
    }

    pub fn config(&self) -> V::Config {
        self.state.lock().config.clone()
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().config.enabled()
    }

    /// Input URL of the elected stream, empty when none.
    pub fn input(&self) -> String {
        self.state.lock().input.clone()
    }

    pub fn input_stream(&self) -> Option<ActiveStream> {
        self.state.lock().input_stream.clone()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.state.lock().history.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn queue(&self, stage: Stage) -> &StageQueue<V::Artifacts> {
        &self.queues[stage.index()]
    }

    pub fn queue_name(&self, stage: Stage) -> &'static str {
        V::QUEUE_NAMES[stage.index()]
    }

    /// Segments currently waiting in `stage`, head first.
    pub fn segments(&self, stage: Stage) -> Vec<Segment<V::Artifacts>> {
        self.queue(stage).segments()
    }

    /// Live HLS playlist of the final queue, using each segment's rendered
    /// output when it has one.
    pub fn playlist(&self) -> Result<String> {
        let finished = self.segments(Stage::Final);
        media::playlist::live_playlist(
            finished
                .iter()
                .map(|s| s.artifacts.rendered().unwrap_or(&s.ts_file)),
        )
    }

    /// Token observed by every loop of this task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn take_receivers(&self) -> Option<TaskReceivers> {
        self.receivers.lock().take()
    }

    /// Ask the persistence writer for a snapshot. Never blocks, coalesces
    /// with a pending request.
    pub fn notify_persistence(&self) {
        let _ = self.persistence_tx.try_send(());
    }

    fn check_uuid(&self, uuid: Option<&str>) -> Result<()> {
        let Some(uuid) = uuid else {
            return Ok(());
        };
        let current = self.uuid();
        if uuid != current {
            return Err(Error::TaskMismatch {
                expected: current,
                actual: uuid.to_string(),
            });
        }
        Ok(())
    }

    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    // Ingestion

    /// Whether a segment notification belongs to the elected input.
    pub fn matches(&self, msg: &HlsMessage) -> bool {
        let state = self.state.lock();
        if !state.config.enabled() {
            return false;
        }
        state
            .input_stream
            .as_ref()
            .is_some_and(|stream| stream.matches(msg))
    }

    /// Accept a segment notification from the media server.
    ///
    /// Returns immediately. The copy into the working directory runs on a
    /// detached task and is dropped if the task is cancelled first. Returns
    /// whether the notification was accepted.
    pub fn on_hls_segment(&self, msg: HlsMessage) -> bool {
        if !self.matches(&msg) {
            return false;
        }

        let tsid = media::artifact_id(msg.seq_no, "org");
        let path = self.workdir.join(format!("{}.ts", tsid));
        let tx = self.ingest_tx.clone();
        let cancel = self.cancel.clone();
        let kind = V::KIND;

        tokio::spawn(async move {
            let start = Instant::now();
            let source = PathBuf::from(&msg.file);

            let copied = tokio::select! {
                _ = cancel.cancelled() => None,
                result = tokio::fs::copy(&source, &path) => Some(result),
            };
            match copied {
                None => {
                    fs::remove_file_quiet(&path).await;
                    debug!("{}: drop segment {} on shutdown", kind, source.display());
                    return;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "{}: copy {} to {} failed", kind, source.display(), path.display());
                    fs::remove_file_quiet(&path).await;
                    return;
                }
                Some(Ok(_)) => {}
            }

            let size = match fs::file_size(&path).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(error = %e, "{}: stat copied segment failed", kind);
                    return;
                }
            };

            let ts_file = TsFile {
                tsid,
                path,
                url: msg.url.clone(),
                seqno: msg.seq_no,
                duration: msg.duration,
                size,
            };
            let segment = IngestedSegment {
                msg,
                ts_file,
                cost: cost_since(start),
            };

            let path = segment.ts_file.path.clone();
            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                result = tx.send(segment) => result.is_ok(),
            };
            if !sent {
                fs::remove_file_quiet(&path).await;
            }
        });

        true
    }

    /// Enqueue a copied segment into the live queue.
    pub async fn accept_segment(&self, ingested: IngestedSegment) {
        if !self.enabled() {
            debug!("{}: disabled, drop {}", V::KIND, ingested.ts_file.tsid);
            fs::remove_file_quiet(&ingested.ts_file.path).await;
            return;
        }

        debug!(
            "{}: got segment seqno={}, file={}, size={}",
            V::KIND,
            ingested.ts_file.seqno,
            ingested.ts_file.path.display(),
            ingested.ts_file.size
        );
        let segment = Segment::new(ingested.msg, ingested.ts_file, ingested.cost);
        {
            let _guard = self.transfer.read();
            self.queue(Stage::Live).enqueue(segment);
        }
        self.notify_persistence();
    }

    // Stream selection

    /// Elect an input among the active streams.
    ///
    /// Returns the elected stream only when it differs from the current input.
    pub async fn select_stream(&self, registry: &dyn StreamRegistry) -> Result<Option<ActiveStream>> {
        if !self.enabled() {
            return Ok(None);
        }

        let streams = registry.active_streams().await?;
        let Some(best) = elect_stream(&streams)?.cloned() else {
            return Ok(None);
        };

        let current = self.state.lock().input_stream.as_ref().map(|s| s.stream_url());
        if current.as_deref() == Some(best.stream_url().as_str()) {
            return Ok(None);
        }
        if let Some(current) = current {
            info!("{}: use best={} as input, was {}", V::KIND, best.stream_url(), current);
        }
        Ok(Some(best))
    }

    /// Hand a newly elected stream to the control loop.
    pub(crate) async fn announce_stream(&self, stream: ActiveStream) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = self.new_stream_tx.send(stream) => {
                if let Err(e) = result {
                    warn!("{}: new stream channel closed, drop {}", V::KIND, e.0.stream_url());
                }
            }
        }
    }

    /// Make `stream` the input of the task.
    pub fn adopt_stream(&self, stream: ActiveStream) {
        let input = stream.input_url();
        info!("{}: adopt stream {} as input {}", V::KIND, stream.stream_url(), input);
        {
            let mut state = self.state.lock();
            state.input = input;
            state.input_stream = Some(stream);
        }
        self.notify_persistence();
    }

    // Stage drivers

    fn stage_context(&self) -> StageContext<V::Config> {
        let state = self.state.lock();
        StageContext {
            task_uuid: state.uuid.clone(),
            workdir: self.workdir.clone(),
            config: state.config.clone(),
            history: state.history.clone(),
        }
    }

    /// Run one pass of the driver consuming `stage`.
    pub async fn drive(&self, stage: Stage) -> Result<Tick> {
        if !self.enabled() {
            return Ok(Tick::Idle);
        }
        let Some(next) = stage.next() else {
            return self.drive_retention().await;
        };

        let queue = self.queue(stage);
        let Some(head) = queue.first() else {
            return Ok(Tick::Idle);
        };

        if let Some(input) = V::required_input(stage, &head) {
            if !fs::file_exists(&input).await {
                if let Some(segment) = queue.dequeue(head.id()) {
                    segment.dispose().await;
                    self.notify_persistence();
                }
                info!(
                    "{}: remove segment {} from {} queue, missing {}",
                    V::KIND,
                    head.id(),
                    queue.name(),
                    input.display()
                );
                return Ok(Tick::Busy);
            }
        }

        if self.queue(next).count() >= self.engine.queue_capacity {
            return Ok(Tick::Idle);
        }

        let ctx = self.stage_context();
        if !self.variant.ready(stage, &head, &ctx.config) {
            return Ok(Tick::Idle);
        }

        let id = head.id().to_string();
        match self.variant.advance(stage, &ctx, head).await {
            Ok(output) => {
                self.complete(stage, next, &id, &ctx.task_uuid, output).await;
                Ok(Tick::Busy)
            }
            Err(e) => self.fail(stage, &id, e).await,
        }
    }

    async fn complete(
        &self,
        stage: Stage,
        next: Stage,
        id: &str,
        task_uuid: &str,
        output: StageOutput<V::Artifacts>,
    ) {
        let StageOutput { segment, exchange } = output;

        let orphan = {
            let _guard = self.transfer.read();
            match self.queue(stage).dequeue(id) {
                Some(_) => {
                    self.queue(next).enqueue(segment);
                    if let Some(exchange) = exchange {
                        let mut state = self.state.lock();
                        // A reset while the stage ran starts a fresh history.
                        if state.uuid == task_uuid {
                            state.history.extend(exchange);
                            let window = state.config.history_window();
                            trim_history(&mut state.history, window);
                        }
                    }
                    None
                }
                None => Some(segment),
            }
        };

        if let Some(orphan) = orphan {
            // The head was removed while the stage ran, typically by reset.
            warn!("{}: segment {} left {} queue while processing", V::KIND, id, self.queue_name(stage));
            orphan.dispose().await;
            return;
        }

        debug!(
            "{}: move segment {} from {} to {} queue",
            V::KIND,
            id,
            self.queue_name(stage),
            self.queue_name(next)
        );
        self.notify_persistence();
    }

    async fn fail(&self, stage: Stage, id: &str, error: Error) -> Result<Tick> {
        let queue = self.queue(stage);
        let attempts = queue.record_failure(id);
        let max = self.engine.max_stage_attempts;
        if max == 0 || attempts < max {
            return Err(error);
        }

        let Some(segment) = queue.dequeue(id) else {
            return Err(error);
        };
        warn!(
            error = %error,
            "{}: dead-letter segment {} of {} queue after {} attempts",
            V::KIND,
            id,
            queue.name(),
            attempts
        );
        segment.dispose().await;

        let letter = DeadLetter {
            tsid: id.to_string(),
            seqno: segment.ts_file.seqno,
            queue: queue.name().to_string(),
            error: error.to_string(),
            attempts,
            at: Utc::now(),
        };
        {
            let mut state = self.state.lock();
            state.dead_letters.push_back(letter);
            while state.dead_letters.len() > self.engine.dead_letter_capacity {
                state.dead_letters.pop_front();
            }
        }
        self.notify_persistence();
        Ok(Tick::Busy)
    }

    async fn drive_retention(&self) -> Result<Tick> {
        let queue = self.queue(Stage::Final);
        if queue.count() <= self.engine.retention {
            return Ok(Tick::Idle);
        }

        let Some(head) = queue.first() else {
            return Ok(Tick::Idle);
        };
        if let Some(segment) = queue.dequeue(head.id()) {
            segment.dispose().await;
            debug!("{}: evict segment {} from {} queue", V::KIND, head.id(), queue.name());
            self.notify_persistence();
        }
        Ok(Tick::Busy)
    }

    // Lifecycle

    /// Persist `config` and restart the control loop so it takes effect.
    ///
    /// A `uuid` that does not name this task is rejected without changes.
    /// Returns the task UUID.
    pub async fn apply(&self, uuid: Option<&str>, config: V::Config) -> Result<String> {
        self.check_uuid(uuid)?;

        let json = serde_json::to_string(&config)?;
        self.store.save_config(V::KIND, &json).await?;

        let uuid = {
            let mut state = self.state.lock();
            state.config = config;
            state.uuid.clone()
        };
        info!("{}: apply config to task {}", V::KIND, uuid);

        self.restart();
        Ok(uuid)
    }

    /// Apply the current config with the enabled flag cleared.
    pub async fn disable(&self, uuid: Option<&str>) -> Result<String> {
        let mut config = self.config();
        config.set_enabled(false);
        self.apply(uuid, config).await
    }

    /// Empty every queue and start over under a new UUID.
    ///
    /// Only allowed while disabled. Returns the new UUID.
    pub async fn reset(&self, uuid: Option<&str>) -> Result<String> {
        self.check_uuid(uuid)?;

        if self.enabled() {
            // Give a just applied disable time to land.
            if !self.wait(self.engine.reset_grace()).await {
                return Err(Error::Other("task is shutting down".to_string()));
            }
            if self.enabled() {
                return Err(Error::TaskRunning);
            }
        }

        let persist = self.persist.lock().await;
        let (old_uuid, new_uuid, drained) = {
            let _guard = self.transfer.write();
            let drained: Vec<_> = self.queues.iter().flat_map(|q| q.take_all()).collect();

            let mut state = self.state.lock();
            state.input.clear();
            state.input_stream = None;
            state.history.clear();
            state.dead_letters.clear();
            let new_uuid = Uuid::new_v4().to_string();
            let old_uuid = std::mem::replace(&mut state.uuid, new_uuid.clone());
            (old_uuid, new_uuid, drained)
        };

        for segment in &drained {
            segment.dispose().await;
        }
        if let Err(e) = self.store.delete_task(V::KIND, &old_uuid).await {
            warn!(error = %e, "{}: delete snapshot of task {} failed", V::KIND, old_uuid);
        }
        drop(persist);
        info!(
            "{}: reset task {} to {}, disposed {} segments",
            V::KIND,
            old_uuid,
            new_uuid,
            drained.len()
        );

        self.notify_persistence();
        // Let the new snapshot land before another reset can start.
        self.wait(self.engine.reset_grace()).await;
        Ok(new_uuid)
    }

    /// Cancel the running control loop. The supervisor starts a new one.
    pub fn restart(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            debug!("{}: restart task", V::KIND);
            token.cancel();
        }
    }

    /// Re-read the stored config, keeping the current one when none is stored.
    pub async fn reload_config(&self) -> Result<V::Config> {
        if let Some(json) = self.store.load_config(V::KIND).await? {
            let config: V::Config = serde_json::from_str(&json)?;
            self.state.lock().config = config;
        }
        Ok(self.config())
    }

    /// One pass of the supervised run loop.
    ///
    /// Reloads the config and, while enabled, adopts elected streams until
    /// restarted or cancelled.
    pub(crate) async fn run_once(&self, new_streams: &mut mpsc::Receiver<ActiveStream>) -> Result<()> {
        let config = self.reload_config().await?;
        if !config.enabled() {
            return Ok(());
        }

        let token = self.cancel.child_token();
        *self.run_token.lock() = Some(token.clone());
        info!("{}: run task {}, config is {:?}", V::KIND, self.uuid(), config);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(stream) = new_streams.recv() => self.adopt_stream(stream),
            }
        }

        self.run_token.lock().take();
        Ok(())
    }

    // Persistence

    /// Consistent copy of the whole task.
    pub fn snapshot(&self) -> TaskSnapshot<V::Artifacts> {
        let _guard = self.transfer.write();
        let state = self.state.lock();
        TaskSnapshot {
            uuid: state.uuid.clone(),
            input: state.input.clone(),
            input_stream: state.input_stream.clone(),
            history: state.history.clone(),
            live: self.queue(Stage::Live).segments(),
            inference: self.queue(Stage::Inference).segments(),
            render: self.queue(Stage::Render).segments(),
            finished: self.queue(Stage::Final).segments(),
            dead_letters: state.dead_letters.iter().cloned().collect(),
        }
    }

    /// Replace identity, input, history and queues with `snapshot`.
    pub fn restore(&self, snapshot: TaskSnapshot<V::Artifacts>) {
        let _guard = self.transfer.write();
        let mut state = self.state.lock();
        state.uuid = snapshot.uuid;
        state.input = snapshot.input;
        state.input_stream = snapshot.input_stream;
        state.history = snapshot.history;
        state.dead_letters = snapshot.dead_letters.into();
        self.queue(Stage::Live).replace(snapshot.live);
        self.queue(Stage::Inference).replace(snapshot.inference);
        self.queue(Stage::Render).replace(snapshot.render);
        self.queue(Stage::Final).replace(snapshot.finished);
    }

    /// Write the current snapshot to the store.
    pub async fn save(&self) -> Result<()> {
        let _persist = self.persist.lock().await;
        let snapshot = self.snapshot();
        let json = serde_json::to_string(&snapshot)?;
        self.store.save_task(V::KIND, &snapshot.uuid, &json).await?;
        debug!("{}: saved task {}, {}B", V::KIND, snapshot.uuid, json.len());
        Ok(())
    }

    /// Load the persisted task, if exactly one is stored.
    ///
    /// Several stored tasks are ambiguous and all of them are deleted.
    /// Returns whether a task was loaded.
    pub async fn load_persisted(&self) -> Result<bool> {
        let _persist = self.persist.lock().await;
        let tasks = self.store.load_tasks(V::KIND).await?;
        if tasks.len() != 1 {
            if !tasks.is_empty() {
                warn!("{}: found {} stored tasks, discarding all", V::KIND, tasks.len());
            }
            self.store.delete_tasks(V::KIND).await?;
            return Ok(false);
        }

        let Some(stored) = tasks.into_iter().next() else {
            return Ok(false);
        };
        let snapshot: TaskSnapshot<V::Artifacts> = serde_json::from_str(&stored.snapshot)?;
        info!(
            "{}: load task {}, live={}, {}={}, {}={}, {}={}",
            V::KIND,
            stored.uuid,
            snapshot.live.len(),
            self.queue_name(Stage::Inference),
            snapshot.inference.len(),
            self.queue_name(Stage::Render),
            snapshot.render.len(),
            self.queue_name(Stage::Final),
            snapshot.finished.len()
        );
        self.restore(snapshot);
        Ok(true)
    }
}
