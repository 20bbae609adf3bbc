//! Staged segment pipelines.
//!
//! A [`PipelineTask`] holds four queues. Segments enter the first one from
//! the media server's HLS hook and move one stage at a time, each stage
//! driven by its own loop in [`PipelineWorker`]. What a stage does is up to
//! the [`PipelineVariant`].

pub mod queue;
pub mod segment;
pub mod snapshot;
pub mod store;
pub mod task;
pub mod variant;
pub mod variants;
pub mod worker;

pub use queue::StageQueue;
pub use segment::{Artifacts, Segment, Stage};
pub use snapshot::{DeadLetter, TaskSnapshot};
pub use store::{MemoryPipelineStore, PipelineStore, SqlitePipelineStore, StoredTask};
pub use task::{IngestedSegment, PipelineTask, Tick, elect_stream};
pub use variant::{PipelineVariant, StageContext, StageOutput, VariantConfig};
pub use worker::PipelineWorker;
