//! Live HLS playlist of a pipeline's finished segments.

use m3u8_rs::{MediaPlaylist, MediaSegment};

use super::TsFile;
use crate::{Error, Result};

/// Render a live media playlist for `files`, oldest first.
///
/// Segment URIs are the file names, relative to the playlist.
pub fn live_playlist<'a>(files: impl IntoIterator<Item = &'a TsFile>) -> Result<String> {
    let files: Vec<&TsFile> = files.into_iter().collect();

    let target_duration = files
        .iter()
        .map(|f| f.duration.ceil() as u64)
        .max()
        .unwrap_or(0)
        .max(1);
    let media_sequence = files.first().map(|f| f.seqno).unwrap_or(0);

    let segments = files
        .iter()
        .map(|f| MediaSegment {
            uri: f
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.tsid.clone()),
            duration: f.duration as f32,
            ..Default::default()
        })
        .collect();

    let playlist = MediaPlaylist {
        version: Some(3),
        target_duration,
        media_sequence,
        segments,
        ..Default::default()
    };

    let mut out = Vec::new();
    playlist
        .write_to(&mut out)
        .map_err(|e| Error::Other(format!("Failed to write playlist: {}", e)))?;
    String::from_utf8(out).map_err(|e| Error::Other(format!("Invalid playlist encoding: {}", e)))
}
