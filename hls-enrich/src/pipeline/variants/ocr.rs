//! Text recognition on still frames, delivered through the callback sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::callback::{CallbackSink, OcrEvent};
use crate::inference::{AiProvider, ChatMessage, VisionRecognizer, VisionRequest};
use crate::media::{self, Transcoder, TsFile};
use crate::pipeline::segment::{Artifacts, Segment, Stage, cost_since, duration_ms};
use crate::pipeline::variant::{PipelineVariant, StageContext, StageOutput, VariantConfig};
use crate::utils::fs;
use crate::{Error, Result};

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_words() -> u32 {
    30
}

fn default_max_window() -> usize {
    5
}

/// Configuration of the OCR pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Whether to recognize the elected stream.
    #[serde(rename = "all", default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub provider: AiProvider,
    #[serde(rename = "aiChatModel", default = "default_model")]
    pub model: String,
    /// Instruction sent with every frame.
    #[serde(rename = "aiChatPrompt", default)]
    pub prompt: String,
    #[serde(rename = "aiChatMaxWords", default = "default_max_words")]
    pub max_words: u32,
    /// Exchanges of history sent with every frame.
    #[serde(rename = "aiChatMaxWindow", default = "default_max_window")]
    pub max_window: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: AiProvider::default(),
            model: default_model(),
            prompt: String::new(),
            max_words: default_max_words(),
            max_window: default_max_window(),
        }
    }
}

impl OcrConfig {
    /// System message bounding the reply length.
    pub fn system_prompt(&self) -> String {
        format!("Keep your reply neat, limiting the reply to {} words.", self.max_words)
    }
}

impl VariantConfig for OcrConfig {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn history_window(&self) -> usize {
        self.max_window.saturating_mul(2)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OcrArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<TsFile>,
    #[serde(rename = "eic", with = "duration_ms", default)]
    pub extract_cost: Duration,
    #[serde(rename = "ocr", default)]
    pub text: String,
    #[serde(rename = "ocrc", with = "duration_ms", default)]
    pub ocr_cost: Duration,
    #[serde(rename = "cbc", with = "duration_ms", default)]
    pub callback_cost: Duration,
}

impl Artifacts for OcrArtifacts {
    fn files(&self) -> Vec<&Path> {
        self.image.iter().map(|f| f.path.as_path()).collect()
    }
}

/// OCR pipeline: live → ocr → callback → cleanup.
pub struct OcrPipeline {
    transcoder: Arc<dyn Transcoder>,
    recognizer: Arc<dyn VisionRecognizer>,
    callback: Arc<dyn CallbackSink>,
}

impl OcrPipeline {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        recognizer: Arc<dyn VisionRecognizer>,
        callback: Arc<dyn CallbackSink>,
    ) -> Self {
        Self {
            transcoder,
            recognizer,
            callback,
        }
    }

    async fn extract_image(
        &self,
        ctx: &StageContext<OcrConfig>,
        mut segment: Segment<OcrArtifacts>,
    ) -> Result<StageOutput<OcrArtifacts>> {
        let start = Instant::now();
        let tsid = media::artifact_id(segment.ts_file.seqno, "image");
        let path = ctx.workdir.join(format!("{}.jpg", tsid));

        self.transcoder.extract_frame(&segment.ts_file.path, &path).await?;
        let size = match fs::file_size(&path).await {
            Ok(size) => size,
            Err(e) => {
                fs::remove_file_quiet(&path).await;
                return Err(e);
            }
        };

        segment.artifacts.extract_cost = cost_since(start);
        debug!(
            "ocr: extract image {} to {}, size={}, cost={:?}",
            segment.id(),
            path.display(),
            size,
            segment.artifacts.extract_cost
        );
        segment.artifacts.image = Some(segment.ts_file.derive(tsid, path, size));
        Ok(StageOutput::new(segment))
    }

    async fn recognize(
        &self,
        ctx: &StageContext<OcrConfig>,
        mut segment: Segment<OcrArtifacts>,
    ) -> Result<StageOutput<OcrArtifacts>> {
        let image = segment
            .artifacts
            .image
            .as_ref()
            .ok_or_else(|| Error::inference(format!("segment {} has no image", segment.id())))?;

        let start = Instant::now();
        let config = &ctx.config;
        let system = config.system_prompt();
        let text = self
            .recognizer
            .recognize(
                &config.provider,
                VisionRequest {
                    image: &image.path,
                    model: &config.model,
                    system: &system,
                    history: &ctx.history,
                    prompt: &config.prompt,
                },
            )
            .await?;

        segment.artifacts.ocr_cost = cost_since(start);
        info!(
            "ocr: recognize {}, model={}, prompt={}, text={}, cost={:?}",
            segment.id(),
            config.model,
            config.prompt,
            text,
            segment.artifacts.ocr_cost
        );

        let exchange = if text.is_empty() {
            None
        } else {
            Some(vec![
                ChatMessage::user(config.prompt.clone()),
                ChatMessage::assistant(text.clone()),
            ])
        };
        segment.artifacts.text = text;
        Ok(StageOutput {
            segment,
            exchange,
        })
    }

    async fn deliver(
        &self,
        ctx: &StageContext<OcrConfig>,
        mut segment: Segment<OcrArtifacts>,
    ) -> Result<StageOutput<OcrArtifacts>> {
        let start = Instant::now();
        let event = OcrEvent::new(
            &ctx.task_uuid,
            &segment.msg,
            &ctx.config.prompt,
            &segment.artifacts.text,
        );
        if let Err(e) = self.callback.on_ocr(&event).await {
            warn!(error = %e, "ocr: ignore callback failure of {}", segment.id());
        }

        segment.artifacts.callback_cost = cost_since(start);
        debug!(
            "ocr: callback {}, cost={:?}",
            segment.id(),
            segment.artifacts.callback_cost
        );
        Ok(StageOutput::new(segment))
    }
}

#[async_trait]
impl PipelineVariant for OcrPipeline {
    type Artifacts = OcrArtifacts;
    type Config = OcrConfig;

    const KIND: &'static str = "ocr";
    const QUEUE_NAMES: [&'static str; 4] = ["live", "ocr", "callback", "cleanup"];

    fn required_input(stage: Stage, segment: &Segment<OcrArtifacts>) -> Option<PathBuf> {
        match stage {
            Stage::Live => Some(segment.ts_file.path.clone()),
            Stage::Inference => Some(
                segment
                    .artifacts
                    .image
                    .as_ref()
                    .map(|f| f.path.clone())
                    .unwrap_or_default(),
            ),
            Stage::Render | Stage::Final => None,
        }
    }

    async fn advance(
        &self,
        stage: Stage,
        ctx: &StageContext<OcrConfig>,
        segment: Segment<OcrArtifacts>,
    ) -> Result<StageOutput<OcrArtifacts>> {
        match stage {
            Stage::Live => self.extract_image(ctx, segment).await,
            Stage::Inference => self.recognize(ctx, segment).await,
            Stage::Render => self.deliver(ctx, segment).await,
            Stage::Final => Err(Error::Other("cleanup queue has no transformation".to_string())),
        }
    }
}
