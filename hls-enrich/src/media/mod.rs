//! Media descriptors shared by every pipeline.

pub mod playlist;
pub mod srt;
pub mod transcoder;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{Error, Result};

pub use transcoder::{FfmpegTranscoder, Transcoder};

/// Vhost name the media server uses when none is configured.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// One media file on local disk.
///
/// Descriptors are never updated in place. A stage that produces a new file
/// builds a new descriptor with [`TsFile::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsFile {
    /// Stable identifier, also the file stem.
    pub tsid: String,
    /// Local path of the file.
    #[serde(rename = "tsfile")]
    pub path: PathBuf,
    /// Source URL of the segment.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub seqno: u64,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl TsFile {
    /// Build a descriptor for a file produced from this one.
    pub fn derive(&self, tsid: String, path: PathBuf, size: u64) -> TsFile {
        TsFile {
            tsid,
            path,
            url: self.url.clone(),
            seqno: self.seqno,
            duration: self.duration,
            size,
        }
    }
}

/// Generate a file identifier such as `42-audio-<uuid>`.
pub fn artifact_id(seqno: u64, kind: &str) -> String {
    format!("{}-{}-{}", seqno, kind, Uuid::new_v4())
}

/// HLS segment notification sent by the media server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HlsMessage {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub vhost: String,
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub param: String,
    /// Segment duration in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Path of the segment written by the media server.
    pub file: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub m3u8_url: String,
    #[serde(default)]
    pub seq_no: u64,
}

/// A stream currently publishing to the media server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStream {
    #[serde(default)]
    pub vhost: String,
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub param: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub client_id: String,
    /// Last update time, RFC 3339.
    pub update: String,
}

impl ActiveStream {
    /// Stream key as `vhost/app/stream`, without the default vhost.
    pub fn stream_url(&self) -> String {
        if self.vhost.is_empty() || self.vhost == DEFAULT_VHOST {
            format!("{}/{}", self.app, self.stream)
        } else {
            format!("{}/{}/{}", self.vhost, self.app, self.stream)
        }
    }

    /// Input URL the pipeline reads the stream from.
    pub fn input_url(&self) -> String {
        format!("rtmp://localhost/{}/{}", self.app, self.stream)
    }

    pub fn update_time(&self) -> Result<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.update).map_err(|e| {
            Error::Other(format!(
                "invalid update time {:?} of {}: {}",
                self.update,
                self.stream_url(),
                e
            ))
        })
    }

    pub fn matches(&self, msg: &HlsMessage) -> bool {
        self.app == msg.app && self.stream == msg.stream
    }
}
