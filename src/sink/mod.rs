//! Downstream delivery seams.
//!
//! Discovered posts are handed to an [`EmbeddingClient`] and a
//! [`VectorStore`] behind trait objects so the pipeline never depends on a
//! concrete vendor. The built-in [`LogSink`] implements both by logging,
//! which is enough to run the engine standalone.

use std::path::Path;

use async_trait::async_trait;

use crate::app::Result;
use crate::domain::DiscoveredPost;

/// Produces vector embeddings for post content.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a captured screenshot from disk.
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>>;
}

/// Persists posts and their embeddings for retrieval.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        post: &DiscoveredPost,
        embedding: Option<&[f32]>,
    ) -> Result<()>;
}

/// Stand-in sink: logs every delivery and embeds nothing.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EmbeddingClient for LogSink {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        tracing::debug!(chars = text.len(), "embed_text (no-op)");
        Ok(Vec::new())
    }

    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        tracing::debug!(path = %path.display(), "embed_image (no-op)");
        Ok(Vec::new())
    }
}

#[async_trait]
impl VectorStore for LogSink {
    async fn upsert(&self, post: &DiscoveredPost, embedding: Option<&[f32]>) -> Result<()> {
        tracing::info!(
            id = %post.id,
            source = %post.source,
            title = %post.title,
            url = %post.url,
            embedded = embedding.is_some(),
            "post delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_accepts_posts() {
        let sink = LogSink;
        let post = DiscoveredPost::new("f", "e1", "https://example.com/1", "First");
        sink.upsert(&post, None).await.unwrap();
        assert!(sink.embed_text("hello").await.unwrap().is_empty());
    }
}
