use async_trait::async_trait;
use bitseek_session::{IdleSupervisor, Session, SessionError, StreamSink};
use tokio_util::sync::CancellationToken;

/// Produces a completed text response for a prompt, streaming increments to
/// `sink` as they arrive.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError>;
}

#[async_trait]
impl Generator for Session {
    async fn generate(
        &self,
        prompt: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        self.send_cancellable(prompt, sink, cancel).await
    }
}

#[async_trait]
impl Generator for IdleSupervisor {
    async fn generate(
        &self,
        prompt: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        let session = self.acquire().await?;
        let result = session.send_cancellable(prompt, sink, cancel).await;
        self.touch();
        result
    }
}
