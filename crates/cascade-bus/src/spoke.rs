//! Reconnecting outbound connection to another stage's Hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_core::{Envelope, Source};

use crate::handler::EnvelopeHandler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscription to one target Hub.
///
/// [`run_forever`](Self::run_forever) keeps the link up with a fixed
/// reconnect delay. [`send`](Self::send) is best-effort: a frame that cannot
/// be written is dropped and reported as `false`.
#[derive(Clone)]
pub struct Spoke {
    inner: Arc<SpokeInner>,
}

struct SpokeInner {
    name: Source,
    target: Source,
    url: String,
    handler: Option<Arc<dyn EnvelopeHandler>>,
    reconnect_delay: Duration,
    // Both halves carry the id of the link they came from, so a reader that
    // closes only tears down its own writer.
    writer: Mutex<Option<(u64, SplitSink<WsStream, Message>)>>,
    // Reader produced by a connect() that run_forever has not picked up yet.
    pending_reader: Mutex<Option<(u64, SplitStream<WsStream>)>>,
    links: AtomicU64,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl Spoke {
    /// `name` is the owning stage, `target` the stage behind `url`.
    pub fn new(name: Source, target: Source, url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self::build(name, target, url.into(), reconnect_delay, None)
    }

    pub fn with_handler(
        name: Source,
        target: Source,
        url: impl Into<String>,
        reconnect_delay: Duration,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Self {
        Self::build(name, target, url.into(), reconnect_delay, Some(handler))
    }

    fn build(
        name: Source,
        target: Source,
        url: String,
        reconnect_delay: Duration,
        handler: Option<Arc<dyn EnvelopeHandler>>,
    ) -> Self {
        Self {
            inner: Arc::new(SpokeInner {
                name,
                target,
                url,
                handler,
                reconnect_delay,
                writer: Mutex::new(None),
                pending_reader: Mutex::new(None),
                links: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn target(&self) -> &Source {
        &self.inner.target
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// One handshake attempt. Never fails past this point; returns whether
    /// the link is up.
    pub async fn connect(&self) -> bool {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return false;
        }
        match connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                let (sink, stream) = ws.split();
                let link = inner.links.fetch_add(1, Ordering::SeqCst) + 1;
                *inner.writer.lock().await = Some((link, sink));
                *inner.pending_reader.lock().await = Some((link, stream));
                inner.connected.store(true, Ordering::SeqCst);
                info!(spoke = %inner.name, target = %inner.target, url = %inner.url, link, "Connected");
                true
            }
            Err(e) => {
                debug!(spoke = %inner.name, target = %inner.target, url = %inner.url, %e, "Connect failed");
                false
            }
        }
    }

    /// Write one envelope. Reconnects once if the link is down; on failure
    /// the envelope is dropped.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let msg = match envelope.to_json() {
            Ok(m) => m,
            Err(e) => {
                warn!(spoke = %self.inner.name, %e, "Failed to serialize envelope");
                return false;
            }
        };

        if self.inner.writer.lock().await.is_none() && !self.connect().await {
            return false;
        }

        let mut writer = self.inner.writer.lock().await;
        let Some((_, sink)) = writer.as_mut() else {
            return false;
        };
        if let Err(e) = sink.send(Message::Text(msg.into())).await {
            debug!(spoke = %self.inner.name, target = %self.inner.target, %e, "Send failed");
            *writer = None;
            self.inner.connected.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Connect, read until the link drops, wait `reconnect_delay`, repeat.
    /// Returns after [`close`](Self::close).
    pub async fn run_forever(&self) {
        let inner = &self.inner;
        while !inner.cancel.is_cancelled() {
            let mut reader = inner.pending_reader.lock().await.take();
            if reader.is_none() && self.connect().await {
                reader = inner.pending_reader.lock().await.take();
            }

            if let Some((link, mut stream)) = reader {
                self.read_until_closed(&mut stream).await;
                self.release(link).await;
                if inner.cancel.is_cancelled() {
                    break;
                }
                info!(spoke = %inner.name, target = %inner.target, "Disconnected, reconnecting");
            }

            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(inner.reconnect_delay) => {}
            }
        }
        debug!(spoke = %inner.name, target = %inner.target, "Run loop stopped");
    }

    /// Drop the writer of `link` once its reader has closed. A writer from
    /// a newer link, opened meanwhile by [`send`](Self::send), stays.
    async fn release(&self, link: u64) {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_ref() {
            Some((current, _)) if *current != link => {
                debug!(spoke = %self.inner.name, link, current, "Newer link already up");
            }
            _ => {
                *writer = None;
                self.inner.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn read_until_closed(&self, stream: &mut SplitStream<WsStream>) {
        let inner = &self.inner;
        loop {
            let msg = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                msg = stream.next() => msg,
            };
            let raw = match msg {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(spoke = %inner.name, %e, "Non-UTF-8 frame dropped");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(spoke = %inner.name, target = %inner.target, %e, "Read failed");
                    return;
                }
            };

            let envelope = match Envelope::from_json(&raw) {
                Ok(env) => env,
                Err(e) => {
                    warn!(spoke = %inner.name, target = %inner.target, %e, "Dropping malformed frame");
                    continue;
                }
            };

            if let Some(handler) = inner.handler.as_ref() {
                let kind = envelope.kind().clone();
                if let Err(e) = handler.handle(envelope).await {
                    warn!(spoke = %inner.name, target = %inner.target, %kind, error = %e, "Handler failed");
                }
            }
        }
    }

    /// Stop the run loop and close the link. Safe to call more than once.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        if let Some((_, mut sink)) = inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        inner.pending_reader.lock().await.take();
        inner.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_spoke() -> Spoke {
        // Port 1 on loopback refuses immediately.
        Spoke::new(
            Source::Slm,
            Source::Asr,
            "ws://127.0.0.1:1",
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_connect_failure_is_false() {
        let spoke = unreachable_spoke();
        assert!(!spoke.connect().await);
        assert!(!spoke.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_hub_drops() {
        let spoke = unreachable_spoke();
        assert!(!spoke.send(&Envelope::ping(Source::Slm)).await);
    }

    #[tokio::test]
    async fn test_closed_link_keeps_newer_writer() {
        let hub = crate::Hub::new(Source::Asr);
        let handle = hub.start("127.0.0.1:0").await.unwrap();
        let spoke = Spoke::new(Source::Slm, Source::Asr, handle.url(), Duration::from_millis(10));

        assert!(spoke.connect().await);
        let (first, _reader) = spoke.inner.pending_reader.lock().await.take().unwrap();
        // a send() reconnecting while the first reader is still draining
        assert!(spoke.connect().await);

        spoke.release(first).await;
        assert!(spoke.is_connected());
        assert!(spoke.send(&Envelope::ping(Source::Slm)).await);

        let (second, _reader) = spoke.inner.pending_reader.lock().await.take().unwrap();
        assert!(second > first);
        spoke.release(second).await;
        assert!(!spoke.is_connected());
        assert!(spoke.inner.writer.lock().await.is_none());

        spoke.close().await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_run_loop() {
        let spoke = unreachable_spoke();
        let runner = {
            let spoke = spoke.clone();
            tokio::spawn(async move { spoke.run_forever().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        spoke.close().await;
        spoke.close().await;
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("run loop should stop after close")
            .unwrap();
        assert!(spoke.is_closed());
        assert!(!spoke.connect().await);
    }
}
