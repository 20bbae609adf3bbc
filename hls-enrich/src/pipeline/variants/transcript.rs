//! Live subtitles: audio extraction, speech recognition, an optional
//! correction gate and subtitle burn-in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::inference::{
    AiProvider, AsrResult, AsrSegment, ChatMessage, SpeechRecognizer, TranscriptionRequest,
};
use crate::media::srt::{self, Cue};
use crate::media::{self, Transcoder, TsFile};
use crate::pipeline::segment::{Artifacts, Segment, Stage, cost_since, duration_ms};
use crate::pipeline::task::PipelineTask;
use crate::pipeline::variant::{PipelineVariant, StageContext, StageOutput, VariantConfig};
use crate::utils::fs;
use crate::{Error, Result};

fn default_model() -> String {
    "whisper-1".to_string()
}

/// Configuration of the transcript pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// Whether to transcribe the elected stream.
    #[serde(rename = "all", default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub provider: AiProvider,
    #[serde(default = "default_model")]
    pub model: String,
    /// ISO-639-1 language of the stream, empty to auto detect.
    #[serde(rename = "lang", default)]
    pub language: String,
    /// Seconds a recognized segment waits in the fix queue for a correction.
    /// Zero passes segments straight through.
    #[serde(rename = "fixWindow", default)]
    pub fix_window_secs: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: AiProvider::default(),
            model: default_model(),
            language: String::new(),
            fix_window_secs: 0,
        }
    }
}

impl VariantConfig for TranscriptConfig {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Only the previous text is kept, as the prompt of the next request.
    fn history_window(&self) -> usize {
        1
    }
}

/// Fields a segment accumulates on its way through the transcript pipeline.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TranscriptArtifacts {
    /// Extracted audio track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<TsFile>,
    #[serde(rename = "eac", with = "duration_ms", default)]
    pub extract_cost: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr: Option<AsrResult>,
    /// Start time of the segment within the stream, in seconds.
    #[serde(rename = "sst", default)]
    pub stream_start_time: f64,
    #[serde(rename = "asrc", with = "duration_ms", default)]
    pub asr_cost: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized_at: Option<DateTime<Utc>>,
    /// Whether the text was corrected in the fix queue.
    #[serde(default)]
    pub corrected: bool,
    /// Subtitle file burned into the overlay, absent when there was no text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srt: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<TsFile>,
    #[serde(rename = "olc", with = "duration_ms", default)]
    pub overlay_cost: Duration,
}

impl Artifacts for TranscriptArtifacts {
    fn files(&self) -> Vec<&Path> {
        let mut files = Vec::new();
        if let Some(audio) = &self.audio {
            files.push(audio.path.as_path());
        }
        if let Some(srt) = &self.srt {
            files.push(srt.as_path());
        }
        if let Some(overlay) = &self.overlay {
            files.push(overlay.path.as_path());
        }
        files
    }

    fn rendered(&self) -> Option<&TsFile> {
        self.overlay.as_ref()
    }
}

/// Timed cues of a recognition result.
///
/// A result without segments shows its whole text for `duration` seconds.
fn cues(asr: &AsrResult, duration: f64) -> Vec<Cue<'_>> {
    if asr.segments.is_empty() {
        return vec![Cue {
            start: 0.0,
            end: duration,
            text: &asr.text,
        }];
    }
    asr.segments
        .iter()
        .map(|s| Cue {
            start: s.start,
            end: s.end,
            text: &s.text,
        })
        .collect()
}

/// Describe a file produced from `source`, removing it if it cannot be read.
async fn produced(source: &TsFile, tsid: String, path: PathBuf) -> Result<TsFile> {
    match fs::file_size(&path).await {
        Ok(size) => Ok(source.derive(tsid, path, size)),
        Err(e) => {
            fs::remove_file_quiet(&path).await;
            Err(e)
        }
    }
}

/// Transcript pipeline: live → asr → fix → overlay.
pub struct TranscriptPipeline {
    transcoder: Arc<dyn Transcoder>,
    recognizer: Arc<dyn SpeechRecognizer>,
}

impl TranscriptPipeline {
    pub fn new(transcoder: Arc<dyn Transcoder>, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            transcoder,
            recognizer,
        }
    }

    async fn extract_audio(
        &self,
        ctx: &StageContext<TranscriptConfig>,
        mut segment: Segment<TranscriptArtifacts>,
    ) -> Result<StageOutput<TranscriptArtifacts>> {
        let start = Instant::now();
        let tsid = media::artifact_id(segment.ts_file.seqno, "audio");
        let path = ctx.workdir.join(format!("{}.m4a", tsid));

        self.transcoder.extract_audio(&segment.ts_file.path, &path).await?;
        let audio = produced(&segment.ts_file, tsid, path).await?;

        segment.artifacts.extract_cost = cost_since(start);
        debug!(
            "transcript: extract audio {} to {}, size={}, cost={:?}",
            segment.id(),
            audio.path.display(),
            audio.size,
            segment.artifacts.extract_cost
        );
        segment.artifacts.audio = Some(audio);
        Ok(StageOutput::new(segment))
    }

    async fn recognize(
        &self,
        ctx: &StageContext<TranscriptConfig>,
        mut segment: Segment<TranscriptArtifacts>,
    ) -> Result<StageOutput<TranscriptArtifacts>> {
        let audio = segment
            .artifacts
            .audio
            .as_ref()
            .ok_or_else(|| Error::transcode(format!("segment {} has no audio", segment.id())))?;

        let start = Instant::now();
        let prompt = ctx.history.last().map(|m| m.content.as_str()).unwrap_or("");
        let asr = self
            .recognizer
            .transcribe(
                &ctx.config.provider,
                TranscriptionRequest {
                    audio: &audio.path,
                    model: &ctx.config.model,
                    language: &ctx.config.language,
                    prompt,
                },
            )
            .await?;
        let stream_start_time = self.transcoder.probe_start_time(&segment.ts_file.path).await?;

        segment.artifacts.asr_cost = cost_since(start);
        segment.artifacts.stream_start_time = stream_start_time;
        segment.artifacts.recognized_at = Some(Utc::now());
        info!(
            "transcript: recognize {}, sst={}, cost={:?}, text={}",
            segment.id(),
            stream_start_time,
            segment.artifacts.asr_cost,
            asr.text
        );

        let exchange = vec![ChatMessage::assistant(asr.text.clone())];
        segment.artifacts.asr = Some(asr);
        Ok(StageOutput::with_exchange(segment, exchange))
    }

    async fn overlay(
        &self,
        ctx: &StageContext<TranscriptConfig>,
        mut segment: Segment<TranscriptArtifacts>,
    ) -> Result<StageOutput<TranscriptArtifacts>> {
        let start = Instant::now();
        let offset = Duration::try_from_secs_f64(segment.artifacts.stream_start_time.max(0.0))
            .unwrap_or_default();
        let subtitles = segment
            .artifacts
            .asr
            .as_ref()
            .map(|asr| srt::render(&cues(asr, segment.ts_file.duration), offset))
            .unwrap_or_default();

        let srt_path = if subtitles.is_empty() {
            None
        } else {
            let path = ctx.workdir.join(format!("{}.srt", segment.id()));
            tokio::fs::write(&path, subtitles.as_bytes())
                .await
                .map_err(|e| fs::io_error("writing subtitles", &path, e))?;
            Some(path)
        };

        let tsid = media::artifact_id(segment.ts_file.seqno, "overlay");
        let path = ctx.workdir.join(format!("{}.ts", tsid));
        if let Err(e) = self
            .transcoder
            .burn_subtitles(&segment.ts_file.path, srt_path.as_deref(), &path)
            .await
        {
            if let Some(srt_path) = &srt_path {
                fs::remove_file_quiet(srt_path).await;
            }
            return Err(e);
        }
        let overlay = produced(&segment.ts_file, tsid, path).await?;

        segment.artifacts.overlay_cost = cost_since(start);
        debug!(
            "transcript: overlay {} to {}, size={}, cost={:?}",
            segment.id(),
            overlay.path.display(),
            overlay.size,
            segment.artifacts.overlay_cost
        );
        segment.artifacts.srt = srt_path;
        segment.artifacts.overlay = Some(overlay);
        Ok(StageOutput::new(segment))
    }
}

#[async_trait]
impl PipelineVariant for TranscriptPipeline {
    type Artifacts = TranscriptArtifacts;
    type Config = TranscriptConfig;

    const KIND: &'static str = "transcript";
    const QUEUE_NAMES: [&'static str; 4] = ["live", "asr", "fix", "overlay"];

    fn required_input(stage: Stage, segment: &Segment<TranscriptArtifacts>) -> Option<PathBuf> {
        match stage {
            Stage::Live | Stage::Render => Some(segment.ts_file.path.clone()),
            // A segment that reached recognition without audio is as good as
            // one whose audio was deleted.
            Stage::Inference => Some(
                segment
                    .artifacts
                    .audio
                    .as_ref()
                    .map(|a| a.path.clone())
                    .unwrap_or_default(),
            ),
            Stage::Final => None,
        }
    }

    fn ready(&self, stage: Stage, segment: &Segment<TranscriptArtifacts>, config: &TranscriptConfig) -> bool {
        if stage != Stage::Render || config.fix_window_secs == 0 || segment.artifacts.corrected {
            return true;
        }
        let Some(recognized_at) = segment.artifacts.recognized_at else {
            return true;
        };
        let window = i64::try_from(config.fix_window_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX);
        Utc::now() - recognized_at >= window
    }

    async fn advance(
        &self,
        stage: Stage,
        ctx: &StageContext<TranscriptConfig>,
        segment: Segment<TranscriptArtifacts>,
    ) -> Result<StageOutput<TranscriptArtifacts>> {
        match stage {
            Stage::Live => self.extract_audio(ctx, segment).await,
            Stage::Inference => self.recognize(ctx, segment).await,
            Stage::Render => self.overlay(ctx, segment).await,
            Stage::Final => Err(Error::Other("final queue has no transformation".to_string())),
        }
    }
}

impl PipelineTask<TranscriptPipeline> {
    /// Replace the recognized text of a segment waiting in the fix queue.
    ///
    /// Without `segments` the text is shown for the whole segment.
    pub fn correct_transcript(
        &self,
        id: &str,
        text: impl Into<String>,
        segments: Option<Vec<AsrSegment>>,
    ) -> Result<()> {
        let text = text.into();
        let found = self.queue(Stage::Render).update(id, |segment| {
            let duration = segment.ts_file.duration;
            let asr = segment.artifacts.asr.get_or_insert_with(AsrResult::default);
            asr.segments = segments.unwrap_or_else(|| {
                vec![AsrSegment {
                    id: 0,
                    seek: 0,
                    start: 0.0,
                    end: duration,
                    text: text.clone(),
                }]
            });
            asr.text = text;
            segment.artifacts.corrected = true;
        });

        if !found {
            return Err(Error::not_found("segment", id));
        }
        info!("transcript: corrected segment {}", id);
        self.notify_persistence();
        Ok(())
    }
}
