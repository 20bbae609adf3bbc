//! Outbound callbacks carrying pipeline results.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::media::HlsMessage;
use crate::utils::http_client;
use crate::{Error, Result};

/// Action name of OCR result callbacks.
pub const ACTION_ON_OCR: &str = "on_ocr";

/// Payload of an OCR result callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrEvent {
    pub action: String,
    /// Task that produced the result.
    pub uuid: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub seqno: u64,
    pub prompt: String,
    pub result: String,
}

impl OcrEvent {
    pub fn new(uuid: &str, msg: &HlsMessage, prompt: &str, text: &str) -> Self {
        Self {
            action: ACTION_ON_OCR.to_string(),
            uuid: uuid.to_string(),
            vhost: msg.vhost.clone(),
            app: msg.app.clone(),
            stream: msg.stream.clone(),
            seqno: msg.seq_no,
            prompt: prompt.to_string(),
            result: text.to_string(),
        }
    }
}

/// Receiver of pipeline results. Delivery is best effort.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn on_ocr(&self, event: &OcrEvent) -> Result<()>;
}

/// Posts callbacks as JSON to a configured URL.
pub struct WebhookCallback {
    url: Option<String>,
    client: Client,
}

impl WebhookCallback {
    /// A `None` URL turns every callback into a no-op.
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url,
            client: http_client::build_client(timeout)?,
        })
    }
}

#[async_trait]
impl CallbackSink for WebhookCallback {
    async fn on_ocr(&self, event: &OcrEvent) -> Result<()> {
        let Some(url) = self.url.as_deref() else {
            debug!(uuid = %event.uuid, seqno = event.seqno, "No callback URL, skip");
            return Ok(());
        };

        let response = self.client.post(url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "callback {} returned {}: {}",
                url, status, body
            )));
        }

        debug!(url = %url, seqno = event.seqno, "Callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_message() {
        let msg = HlsMessage {
            vhost: "__defaultVhost__".to_string(),
            app: "live".to_string(),
            stream: "livestream".to_string(),
            seq_no: 12,
            file: "./objs/nginx/html/live/livestream-12.ts".to_string(),
            ..Default::default()
        };
        let event = OcrEvent::new("task-1", &msg, "Read the text", "Breaking news");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "on_ocr");
        assert_eq!(json["seqno"], 12);
        assert_eq!(json["result"], "Breaking news");
    }

    #[tokio::test]
    async fn test_webhook_without_url_is_noop() {
        let sink = WebhookCallback::new(None, Duration::from_secs(1)).unwrap();
        let event = OcrEvent::new("task-1", &HlsMessage::default(), "", "");
        assert!(sink.on_ocr(&event).await.is_ok());
    }
}
