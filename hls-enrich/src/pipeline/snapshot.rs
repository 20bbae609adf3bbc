//! Persisted form of a pipeline task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::segment::Segment;
use crate::inference::ChatMessage;
use crate::media::ActiveStream;

/// A segment dropped after failing too many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub tsid: String,
    pub seqno: u64,
    /// Queue the segment failed in.
    pub queue: String,
    pub error: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Full JSON snapshot of a task: identity, input, history and all queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot<A> {
    pub uuid: String,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_stream: Option<ActiveStream>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub live: Vec<Segment<A>>,
    #[serde(default)]
    pub inference: Vec<Segment<A>>,
    #[serde(default)]
    pub render: Vec<Segment<A>>,
    #[serde(rename = "final", default)]
    pub finished: Vec<Segment<A>>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetter>,
}
