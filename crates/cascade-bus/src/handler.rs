//! Inbound envelope handlers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cascade_core::Envelope;

/// Receives every inbound envelope of a Hub or Spoke.
///
/// Errors are logged by the caller and never close the connection.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Adapter for async closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.0)(envelope).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forward envelopes into a stage's event loop.
#[async_trait]
impl EnvelopeHandler for mpsc::UnboundedSender<Envelope> {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.send(envelope)
            .map_err(|_| anyhow::anyhow!("stage loop is gone"))
    }
}
