//! Pipeline segments and the stages they move through.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::media::{HlsMessage, TsFile};
use crate::utils::fs;

/// Queue a segment sits in, named after the work it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Captured, waiting for feature extraction.
    Live,
    /// Extracted, waiting for AI inference.
    Inference,
    /// Inferred, waiting for render or delivery.
    Render,
    /// Finished, kept until evicted by retention.
    Final,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Live, Stage::Inference, Stage::Render, Stage::Final];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Queue a segment moves to when this stage succeeds.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Live => Some(Stage::Inference),
            Stage::Inference => Some(Stage::Render),
            Stage::Render => Some(Stage::Final),
            Stage::Final => None,
        }
    }
}

/// Variant specific fields accumulated by a segment.
pub trait Artifacts:
    Debug + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Files owned by these artifacts, removed when the segment is disposed.
    fn files(&self) -> Vec<&Path>;

    /// Output file to publish once the segment is final, if any.
    fn rendered(&self) -> Option<&TsFile> {
        None
    }
}

/// The unit of work carried through the queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment<A> {
    /// Notification the segment was captured from.
    pub msg: HlsMessage,
    /// The captured segment.
    #[serde(rename = "tsfile")]
    pub ts_file: TsFile,
    /// Cost of copying the segment into the working directory.
    #[serde(rename = "igc", with = "duration_ms", default)]
    pub ingest_cost: Duration,
    #[serde(flatten)]
    pub artifacts: A,
}

impl<A: Artifacts> Segment<A> {
    pub fn new(msg: HlsMessage, ts_file: TsFile, ingest_cost: Duration) -> Self {
        Self {
            msg,
            ts_file,
            ingest_cost,
            artifacts: A::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.ts_file.tsid
    }

    /// Every file the segment owns.
    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.ts_file.path.as_path()];
        files.extend(self.artifacts.files());
        files
    }

    /// Remove every file the segment owns. Missing files are ignored.
    pub async fn dispose(&self) {
        for file in self.files() {
            fs::remove_file_quiet(file).await;
        }
    }
}

/// Elapsed time since `start`, rounded up to whole milliseconds.
pub fn cost_since(start: Instant) -> Duration {
    let nanos = start.elapsed().as_nanos();
    Duration::from_millis(nanos.div_ceil(1_000_000) as u64)
}

/// Serialize a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
