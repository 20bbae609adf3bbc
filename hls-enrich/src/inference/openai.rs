//! OpenAI compatible HTTP client.

use async_trait::async_trait;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{
    AiProvider, AsrResult, ChatMessage, SpeechRecognizer, TranscriptionRequest, VisionRecognizer,
    VisionRequest,
};
use crate::utils::http_client;
use crate::{Error, Result};

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `/audio/transcriptions`, `/chat/completions` and `/models`.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
}

impl OpenAiClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client::build_client(request_timeout)?,
        })
    }

    fn authorize(&self, builder: RequestBuilder, provider: &AiProvider) -> RequestBuilder {
        let mut builder = builder.bearer_auth(&provider.secret_key);
        if !provider.organization.is_empty() {
            builder = builder.header("OpenAI-Organization", &provider.organization);
        }
        builder
    }

    async fn ensure_success(endpoint: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(Error::inference(format!(
            "{} returned {}: {}",
            endpoint, status, body
        )))
    }

    /// Verify the provider is reachable and the credentials are accepted.
    pub async fn check(&self, provider: &AiProvider) -> Result<()> {
        let url = format!("{}/models", provider.base_url());
        let response = self
            .authorize(self.client.get(&url), provider)
            .send()
            .await?;
        Self::ensure_success(&url, response).await?;
        Ok(())
    }
}

/// Build the chat messages for a vision request.
fn vision_messages(request: &VisionRequest<'_>, image_base64: &str) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.history.len() + 3);
    messages.push(json!(ChatMessage::system(request.system)));
    messages.extend(request.history.iter().map(|m| json!(m)));
    messages.push(json!(ChatMessage::user(request.prompt)));
    messages.push(json!({
        "role": "user",
        "content": [{
            "type": "image_url",
            "image_url": {
                "url": format!("data:image/jpeg;base64,{}", image_base64),
                "detail": "low",
            },
        }],
    }));
    messages
}

fn first_choice(response: ChatCompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| Error::inference("chat completion returned no choices"))
}

#[async_trait]
impl SpeechRecognizer for OpenAiClient {
    async fn transcribe(
        &self,
        provider: &AiProvider,
        request: TranscriptionRequest<'_>,
    ) -> Result<AsrResult> {
        let data = tokio::fs::read(request.audio)
            .await
            .map_err(|e| Error::io_path("reading audio", request.audio, e))?;
        let file_name = request
            .audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.m4a".to_string());

        let file = Part::bytes(data).file_name(file_name).mime_str("audio/mp4")?;
        let mut form = Form::new()
            .text("model", request.model.to_string())
            .text("response_format", "verbose_json")
            .part("file", file);
        if !request.language.is_empty() {
            form = form.text("language", request.language.to_string());
        }
        if !request.prompt.is_empty() {
            form = form.text("prompt", request.prompt.to_string());
        }

        let url = format!("{}/audio/transcriptions", provider.base_url());
        debug!(url = %url, audio = %request.audio.display(), "Requesting transcription");
        let response = self
            .authorize(self.client.post(&url), provider)
            .multipart(form)
            .send()
            .await?;
        let response = Self::ensure_success(&url, response).await?;
        Ok(response.json::<AsrResult>().await?)
    }
}

#[async_trait]
impl VisionRecognizer for OpenAiClient {
    async fn recognize(&self, provider: &AiProvider, request: VisionRequest<'_>) -> Result<String> {
        let data = tokio::fs::read(request.image)
            .await
            .map_err(|e| Error::io_path("reading image", request.image, e))?;
        let image = base64::engine::general_purpose::STANDARD.encode(data);

        let body = json!({
            "model": request.model,
            "messages": vision_messages(&request, &image),
        });

        let url = format!("{}/chat/completions", provider.base_url());
        debug!(url = %url, image = %request.image.display(), "Requesting chat completion");
        let response = self
            .authorize(self.client.post(&url), provider)
            .json(&body)
            .send()
            .await?;
        let response = Self::ensure_success(&url, response).await?;
        first_choice(response.json().await?)
    }
}
