//! Background loops driving one pipeline task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::segment::Stage;
use super::task::{IngestedSegment, PipelineTask, Tick};
use super::variant::{PipelineVariant, VariantConfig};
use crate::media::ActiveStream;
use crate::streams::StreamRegistry;
use crate::utils::fs;
use crate::{Error, Result};

/// Runs the supervisor, ingestion, selector, persistence and stage driver
/// loops of a task.
///
/// Every loop observes the task's cancellation token.
pub struct PipelineWorker<V: PipelineVariant> {
    task: Arc<PipelineTask<V>>,
    registry: Arc<dyn StreamRegistry>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl<V: PipelineVariant> PipelineWorker<V> {
    pub fn new(task: Arc<PipelineTask<V>>, registry: Arc<dyn StreamRegistry>) -> Self {
        Self {
            task,
            registry,
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn task(&self) -> &Arc<PipelineTask<V>> {
        &self.task
    }

    /// Restore the persisted task and spawn its loops.
    ///
    /// A worker starts at most once, even when starting fails.
    pub async fn start(&self) -> Result<()> {
        let task = &self.task;
        let receivers = task
            .take_receivers()
            .ok_or_else(|| Error::Other(format!("{} worker already started", V::KIND)))?;

        fs::ensure_dir_all_with_op("creating work directory", task.workdir()).await?;
        task.load_persisted().await?;
        let config = task.reload_config().await?;

        info!(
            "Starting {} pipeline, task={}, enabled={}, workdir={}",
            V::KIND,
            task.uuid(),
            config.enabled(),
            task.workdir().display()
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return Err(Error::Other(format!("{} worker already stopped", V::KIND)));
        };

        join_set.spawn(supervise(task.clone(), receivers.new_stream));
        join_set.spawn(consume_ingested(task.clone(), receivers.ingest));
        join_set.spawn(watch_streams(task.clone(), self.registry.clone()));
        join_set.spawn(write_snapshots(task.clone(), receivers.persistence));
        for stage in Stage::ALL {
            join_set.spawn(drive_stage(task.clone(), stage));
        }
        Ok(())
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn stop(&self) {
        info!("Stopping {} pipeline", V::KIND);
        self.task.cancellation_token().cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!("{} pipeline loop failed: {}", V::KIND, e);
                }
            }
        }

        info!("{} pipeline stopped", V::KIND);
    }

    pub fn is_running(&self) -> bool {
        !self.task.cancellation_token().is_cancelled()
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
async fn pause<V: PipelineVariant>(task: &PipelineTask<V>, duration: Duration) -> bool {
    let cancel = task.cancellation_token();
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Re-enter the control loop after every restart until cancelled.
async fn supervise<V: PipelineVariant>(
    task: Arc<PipelineTask<V>>,
    mut new_streams: mpsc::Receiver<ActiveStream>,
) {
    let engine = task.engine().clone();
    loop {
        let delay = match task.run_once(&mut new_streams).await {
            Ok(()) => engine.run_interval(),
            Err(e) => {
                warn!(error = %e, "{}: run task failed, retry in {:?}", V::KIND, engine.run_backoff());
                engine.run_backoff()
            }
        };
        if !pause(&task, delay).await {
            break;
        }
    }
    debug!("{}: supervisor done", V::KIND);
}

async fn consume_ingested<V: PipelineVariant>(
    task: Arc<PipelineTask<V>>,
    mut ingested: mpsc::Receiver<IngestedSegment>,
) {
    let cancel = task.cancellation_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            segment = ingested.recv() => match segment {
                Some(segment) => task.accept_segment(segment).await,
                None => break,
            },
        }
    }

    // Copies that finished after shutdown are not enqueued.
    ingested.close();
    while let Ok(segment) = ingested.try_recv() {
        fs::remove_file_quiet(&segment.ts_file.path).await;
    }
    debug!("{}: ingest consumer done", V::KIND);
}

async fn watch_streams<V: PipelineVariant>(task: Arc<PipelineTask<V>>, registry: Arc<dyn StreamRegistry>) {
    let engine = task.engine().clone();
    loop {
        let delay = match task.select_stream(registry.as_ref()).await {
            Ok(Some(stream)) => {
                task.announce_stream(stream).await;
                engine.tick_interval()
            }
            Ok(None) => engine.selector_idle(),
            Err(e) => {
                warn!(error = %e, "{}: select stream failed", V::KIND);
                engine.error_backoff()
            }
        };
        if !pause(&task, delay).await {
            break;
        }
    }
    debug!("{}: stream selector done", V::KIND);
}

async fn write_snapshots<V: PipelineVariant>(task: Arc<PipelineTask<V>>, mut signals: mpsc::Receiver<()>) {
    let cancel = task.cancellation_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
                if let Err(e) = task.save().await {
                    warn!(error = %e, "{}: save task {} failed", V::KIND, task.uuid());
                }
            }
        }
    }

    if let Err(e) = task.save().await {
        warn!(error = %e, "{}: final save of task {} failed", V::KIND, task.uuid());
    }
    debug!("{}: persistence writer done", V::KIND);
}

async fn drive_stage<V: PipelineVariant>(task: Arc<PipelineTask<V>>, stage: Stage) {
    let engine = task.engine().clone();
    let cancel = task.cancellation_token();
    let idle = if stage == Stage::Final {
        engine.retention_idle()
    } else {
        engine.tick_interval()
    };

    debug!("{}: {} driver started", V::KIND, task.queue_name(stage));
    while !cancel.is_cancelled() {
        // Register for wakeups before looking at the queues so a change made
        // during the pass is not missed.
        let upstream = task.queue(stage).changed();
        let downstream = task.queue(stage.next().unwrap_or(stage)).changed();
        tokio::pin!(upstream, downstream);
        upstream.as_mut().enable();
        downstream.as_mut().enable();

        match task.drive(stage).await {
            Ok(Tick::Busy) => {
                tokio::task::yield_now().await;
            }
            Ok(Tick::Idle) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                    _ = &mut upstream => {}
                    _ = &mut downstream => {}
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "{}: {} driver failed, retry in {:?}",
                    V::KIND,
                    task.queue_name(stage),
                    engine.error_backoff()
                );
                if !pause(&task, engine.error_backoff()).await {
                    break;
                }
            }
        }
    }
    debug!("{}: {} driver done", V::KIND, task.queue_name(stage));
}
