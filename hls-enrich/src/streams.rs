//! Registry of streams currently publishing to the media server.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::Result;
use crate::media::ActiveStream;

/// Read side of the active stream registry.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    async fn active_streams(&self) -> Result<Vec<ActiveStream>>;
}

/// In-process registry fed by the publish and unpublish hooks.
#[derive(Default)]
pub struct MemoryStreamRegistry {
    streams: RwLock<HashMap<String, ActiveStream>>,
}

impl MemoryStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish, or refresh the update time of a known stream.
    pub fn publish(&self, stream: ActiveStream) {
        let key = stream.stream_url();
        debug!(stream = %key, update = %stream.update, "Stream published");
        self.streams.write().insert(key, stream);
    }

    pub fn unpublish(&self, stream_url: &str) -> Option<ActiveStream> {
        let removed = self.streams.write().remove(stream_url);
        if removed.is_some() {
            debug!(stream = %stream_url, "Stream unpublished");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

#[async_trait]
impl StreamRegistry for MemoryStreamRegistry {
    async fn active_streams(&self) -> Result<Vec<ActiveStream>> {
        Ok(self.streams.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str, update: &str) -> ActiveStream {
        ActiveStream {
            vhost: "__defaultVhost__".to_string(),
            app: "live".to_string(),
            stream: name.to_string(),
            param: String::new(),
            server_id: String::new(),
            client_id: String::new(),
            update: update.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_refresh_unpublish() {
        let registry = MemoryStreamRegistry::new();
        registry.publish(stream("a", "2024-01-01T00:00:00Z"));
        registry.publish(stream("a", "2024-01-01T00:00:05Z"));
        registry.publish(stream("b", "2024-01-01T00:00:01Z"));
        assert_eq!(registry.len(), 2);

        let streams = registry.active_streams().await.unwrap();
        let a = streams.iter().find(|s| s.stream == "a").unwrap();
        assert_eq!(a.update, "2024-01-01T00:00:05Z");

        assert!(registry.unpublish("live/a").is_some());
        assert!(registry.unpublish("live/a").is_none());
        assert_eq!(registry.len(), 1);
    }
}
