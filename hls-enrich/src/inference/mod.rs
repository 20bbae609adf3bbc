//! AI inference collaborators.
//!
//! Pipelines talk to speech and vision models through the [`SpeechRecognizer`]
//! and [`VisionRecognizer`] traits. [`OpenAiClient`] implements both against an
//! OpenAI compatible HTTP API.

mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

pub use openai::OpenAiClient;

/// Default base URL of the AI provider.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Credentials and endpoint of an AI provider.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiProvider {
    #[serde(rename = "secretKey", default)]
    pub secret_key: String,
    /// Base URL including the API version, e.g. `https://api.openai.com/v1`.
    #[serde(rename = "baseURL", default)]
    pub base_url: String,
    #[serde(default)]
    pub organization: String,
}

impl AiProvider {
    pub fn base_url(&self) -> &str {
        let url = self.base_url.trim().trim_end_matches('/');
        if url.is_empty() { DEFAULT_BASE_URL } else { url }
    }
}

impl std::fmt::Debug for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiProvider")
            .field("secret_key", &format_args!("{}B", self.secret_key.len()))
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A time aligned piece of a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrSegment {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub seek: i64,
    /// Start in seconds relative to the audio.
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Speech recognition result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsrResult {
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub duration: f64,
    pub text: String,
    #[serde(default)]
    pub segments: Vec<AsrSegment>,
}

pub struct TranscriptionRequest<'a> {
    pub audio: &'a Path,
    pub model: &'a str,
    /// ISO-639-1 language hint, empty to auto detect.
    pub language: &'a str,
    /// Previous text, for continuity across segments.
    pub prompt: &'a str,
}

pub struct VisionRequest<'a> {
    pub image: &'a Path,
    pub model: &'a str,
    pub system: &'a str,
    pub history: &'a [ChatMessage],
    pub prompt: &'a str,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(
        &self,
        provider: &AiProvider,
        request: TranscriptionRequest<'_>,
    ) -> Result<AsrResult>;
}

#[async_trait]
pub trait VisionRecognizer: Send + Sync {
    /// Describe an image, returning the model's reply.
    async fn recognize(&self, provider: &AiProvider, request: VisionRequest<'_>) -> Result<String>;
}
