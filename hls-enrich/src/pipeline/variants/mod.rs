//! Concrete pipelines built on the generic engine.

pub mod ocr;
pub mod transcript;

pub use ocr::{OcrArtifacts, OcrConfig, OcrPipeline};
pub use transcript::{TranscriptArtifacts, TranscriptConfig, TranscriptPipeline};
