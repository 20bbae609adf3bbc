//! The seam between the generic engine and a concrete pipeline.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::path::PathBuf;

use super::segment::{Artifacts, Segment, Stage};
use crate::Result;
use crate::inference::ChatMessage;

/// Per-pipeline configuration document.
pub trait VariantConfig:
    Debug + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Messages of rolling history kept between inference calls.
    fn history_window(&self) -> usize;
}

/// Inputs a stage transformation may read.
#[derive(Debug, Clone)]
pub struct StageContext<C> {
    pub task_uuid: String,
    /// Directory derived files are written to.
    pub workdir: PathBuf,
    pub config: C,
    pub history: Vec<ChatMessage>,
}

/// Result of a successful stage transformation.
#[derive(Debug)]
pub struct StageOutput<A> {
    /// The segment with its new fields set.
    pub segment: Segment<A>,
    /// Messages to append to the rolling history.
    pub exchange: Option<Vec<ChatMessage>>,
}

impl<A> StageOutput<A> {
    pub fn new(segment: Segment<A>) -> Self {
        Self {
            segment,
            exchange: None,
        }
    }

    pub fn with_exchange(segment: Segment<A>, exchange: Vec<ChatMessage>) -> Self {
        Self {
            segment,
            exchange: Some(exchange),
        }
    }
}

/// A concrete pipeline: its artifacts, configuration and stage transformations.
///
/// The engine owns queueing, backpressure, persistence and lifecycle. A
/// variant only turns the head of one stage into input for the next.
#[async_trait]
pub trait PipelineVariant: Send + Sync + 'static {
    type Artifacts: Artifacts;
    type Config: VariantConfig;

    /// Storage key of the pipeline kind.
    const KIND: &'static str;

    /// Display names of the four queues, in [`Stage`] order.
    const QUEUE_NAMES: [&'static str; 4];

    /// File that must exist for the head of `stage` to be processed.
    fn required_input(stage: Stage, segment: &Segment<Self::Artifacts>) -> Option<PathBuf>;

    /// Whether the head of `stage` may be processed now. Holding returns
    /// false without counting as a failure.
    fn ready(&self, _stage: Stage, _segment: &Segment<Self::Artifacts>, _config: &Self::Config) -> bool {
        true
    }

    /// Run the transformation of `stage` on a copy of its head.
    ///
    /// Must be idempotent: a cancelled or failed run is retried on the same
    /// segment from scratch. Never called for [`Stage::Final`].
    async fn advance(
        &self,
        stage: Stage,
        ctx: &StageContext<Self::Config>,
        segment: Segment<Self::Artifacts>,
    ) -> Result<StageOutput<Self::Artifacts>>;
}
