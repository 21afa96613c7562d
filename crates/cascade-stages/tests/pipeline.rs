//! Stage integration tests: real Hubs on free ports, fake collaborators.
//!
//! Run with: `cargo test -p cascade-stages --test pipeline`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use cascade_bus::Hub;
use cascade_core::config::{BusConfig, Config, StageEndpoint, StagesConfig, T2iConfig};
use cascade_core::protocol::{ConfigUpdate, GenerationComplete, GenerationError, KeywordEvent};
use cascade_core::{Envelope, MessageType, Source};
use cascade_flow::{ManualClock, SystemClock};
use cascade_stages::{
    AsrStage, BridgeStage, ExtractRequest, Extraction, GeneratedImage, GenerationJob,
    ImageGenerator, KeywordExtractor, SlmStage, T2iStage, bridge_seq,
};

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Config with every stage on its own free local port.
fn local_config() -> Config {
    let endpoint = || Some(StageEndpoint::new("127.0.0.1", find_free_port()));
    Config {
        stages: Some(StagesConfig {
            asr: endpoint(),
            slm: endpoint(),
            state: endpoint(),
            t2i: endpoint(),
            bridge: endpoint(),
        }),
        bus: Some(BusConfig {
            reconnect_delay_ms: 50,
        }),
        t2i: Some(T2iConfig {
            debounce_secs: 0.0,
            ..T2iConfig::default()
        }),
        ..Config::default()
    }
}

fn addr(config: &Config, stage: Source) -> String {
    format!("127.0.0.1:{}", config.endpoint(&stage).port)
}

async fn wait_for_connections(hub: &Hub, expected: usize) {
    for _ in 0..150 {
        if hub.connection_count().await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} connections on {}, have {}",
        hub.name(),
        hub.connection_count().await
    );
}

/// Read frames until one of `kind` shows up.
async fn next_of_kind<S>(ws: &mut S, kind: MessageType) -> Envelope
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
            .unwrap()
            .unwrap();
        let Ok(text) = msg.to_text() else { continue };
        let envelope = Envelope::from_json(text).unwrap();
        if envelope.kind() == &kind {
            return envelope;
        }
    }
}

/// Always asks for an image of the first two words.
struct ScriptedExtractor;

#[async_trait]
impl KeywordExtractor for ScriptedExtractor {
    async fn extract(&self, request: ExtractRequest) -> anyhow::Result<Extraction> {
        let words: Vec<String> = request
            .text
            .split_whitespace()
            .take(2)
            .map(str::to_string)
            .collect();
        Ok(Extraction {
            keywords: words.clone(),
            response: format!("heard {}", request.text),
            image_trigger: true,
            image_keywords: words,
            topic_change_score: 0.8,
            history_length: 1,
        })
    }
}

/// Fails the first call, succeeds afterwards.
#[derive(Default)]
struct FlakyGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageGenerator for FlakyGenerator {
    async fn generate(&self, job: &GenerationJob) -> anyhow::Result<GeneratedImage> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("ComfyUI unreachable");
        }
        let filename = format!("{}.png", job.request.request_id);
        Ok(GeneratedImage {
            image_path: std::env::temp_dir().join(&filename),
            filename,
        })
    }
}

struct InstantGenerator;

#[async_trait]
impl ImageGenerator for InstantGenerator {
    async fn generate(&self, job: &GenerationJob) -> anyhow::Result<GeneratedImage> {
        let filename = format!("{}.png", job.request.request_id);
        Ok(GeneratedImage {
            image_path: format!("/tmp/{filename}").into(),
            filename,
        })
    }
}

fn keyword_event(keywords: &[&str]) -> Envelope {
    Envelope::from_payload(
        Source::Slm,
        &KeywordEvent {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            image_trigger: true,
            image_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            original_text: keywords.join(" "),
            ..KeywordEvent::default()
        },
    )
}

#[tokio::test]
async fn test_transcript_becomes_image_through_bridge() {
    let config = local_config();
    let cancel = CancellationToken::new();

    let asr = AsrStage::new(&config, Arc::new(SystemClock));
    let slm = SlmStage::new(&config, Arc::new(ScriptedExtractor));
    let t2i = T2iStage::new(&config, Arc::new(InstantGenerator), Arc::new(SystemClock));
    let bridge = BridgeStage::new(&config);

    let asr_hub = asr.hub().clone();
    let slm_hub = slm.hub().clone();
    let t2i_hub = t2i.hub().clone();
    let handles = vec![
        asr_hub.start(&addr(&config, Source::Asr)).await.unwrap(),
        slm_hub.start(&addr(&config, Source::Slm)).await.unwrap(),
        t2i_hub.start(&addr(&config, Source::T2i)).await.unwrap(),
        bridge.hub().start(&addr(&config, Source::Bridge)).await.unwrap(),
    ];

    let (units_tx, units_rx) = mpsc::channel(8);
    tokio::spawn(asr.run(units_rx, cancel.clone()));
    tokio::spawn(slm.run(cancel.clone()));
    tokio::spawn(t2i.run(cancel.clone()));
    tokio::spawn(bridge.run(cancel.clone()));

    let (mut observer, _) = connect_async(config.endpoint(&Source::Bridge).url())
        .await
        .unwrap();

    // slm and bridge on asr; t2i and bridge on slm; bridge on t2i
    wait_for_connections(&asr_hub, 2).await;
    wait_for_connections(&slm_hub, 2).await;
    wait_for_connections(&t2i_hub, 1).await;

    units_tx.send("volcano eruption tonight".into()).await.unwrap();

    let text = next_of_kind(&mut observer, MessageType::TextEvent).await;
    assert_eq!(text.source(), &Source::Asr);
    assert!(bridge_seq(&text).is_some());

    let keywords = next_of_kind(&mut observer, MessageType::KeywordEvent).await;
    let keywords: KeywordEvent = keywords.decode().unwrap();
    assert_eq!(keywords.image_keywords, vec!["volcano", "eruption"]);
    assert_eq!(keywords.original_text, "volcano eruption tonight");

    let done = next_of_kind(&mut observer, MessageType::GenerationComplete).await;
    let seq = bridge_seq(&done).unwrap();
    let done: GenerationComplete = done.decode().unwrap();
    assert_eq!(done.keywords, vec!["volcano", "eruption"]);
    assert!(done.request_id.starts_with("t2i_"));
    assert_eq!(done.filename, format!("{}.png", done.request_id));
    assert_eq!(done.structure["version_tag"], "0.0.1");
    assert!(seq > bridge_seq(&text).unwrap());

    cancel.cancel();
    for handle in handles {
        handle.stop().await;
    }
}

#[tokio::test]
async fn test_generation_failure_is_reported_and_worker_continues() {
    let config = local_config();
    let cancel = CancellationToken::new();
    let clock = Arc::new(ManualClock::new(1_000.0));

    // stand-in for the language stage
    let slm_hub = Hub::new(Source::Slm);
    let slm_handle = slm_hub.start(&addr(&config, Source::Slm)).await.unwrap();

    let t2i = T2iStage::new(&config, Arc::new(FlakyGenerator::default()), clock.clone());
    let t2i_handle = t2i.hub().start(&addr(&config, Source::T2i)).await.unwrap();
    tokio::spawn(t2i.run(cancel.clone()));

    let (mut observer, _) = connect_async(t2i_handle.url()).await.unwrap();
    wait_for_connections(&slm_hub, 1).await;

    slm_hub.broadcast(&keyword_event(&["forest", "fire"])).await;
    let start = next_of_kind(&mut observer, MessageType::GenerationStart).await;
    let failed = next_of_kind(&mut observer, MessageType::GenerationError).await;
    let failed: GenerationError = failed.decode().unwrap();
    assert_eq!(start.get("request_id"), Some(&json!(failed.request_id)));
    assert_eq!(failed.request_id, "t2i_1000000");
    assert!(failed.error.contains("ComfyUI unreachable"));

    clock.advance(5.0);
    slm_hub.broadcast(&keyword_event(&["river"])).await;
    let done = next_of_kind(&mut observer, MessageType::GenerationComplete).await;
    let done: GenerationComplete = done.decode().unwrap();
    assert_eq!(done.request_id, "t2i_1005000");
    assert_eq!(done.keywords, vec!["river"]);

    cancel.cancel();
    t2i_handle.stop().await;
    slm_handle.stop().await;
}

#[tokio::test]
async fn test_t2i_accepts_config_update_on_its_hub() {
    let config = local_config();
    let cancel = CancellationToken::new();

    let t2i = T2iStage::new(&config, Arc::new(InstantGenerator), Arc::new(SystemClock));
    let handle = t2i.hub().start(&addr(&config, Source::T2i)).await.unwrap();
    let slm_hub = Hub::new(Source::Slm);
    let slm_handle = slm_hub.start(&addr(&config, Source::Slm)).await.unwrap();
    tokio::spawn(t2i.run(cancel.clone()));

    let (mut client, _) = connect_async(handle.url()).await.unwrap();
    wait_for_connections(&slm_hub, 1).await;

    let update = Envelope::from_payload(
        Source::Client,
        &ConfigUpdate {
            service: "t2i".into(),
            param: "version_tag".into(),
            value: json!("2.1.0"),
        },
    );
    client
        .send(Message::Text(update.to_json().unwrap().into()))
        .await
        .unwrap();
    // let the stage loop apply it before the request arrives
    tokio::time::sleep(Duration::from_millis(100)).await;

    slm_hub.broadcast(&keyword_event(&["glacier"])).await;
    let done = next_of_kind(&mut client, MessageType::GenerationComplete).await;
    let done: GenerationComplete = done.decode().unwrap();
    assert_eq!(done.version_tag, "2.1.0");

    cancel.cancel();
    handle.stop().await;
    slm_handle.stop().await;
}

#[tokio::test]
async fn test_bridge_numbers_relays_and_answers_ping() {
    let config = local_config();
    let cancel = CancellationToken::new();

    let asr_hub = Hub::new(Source::Asr);
    let asr_handle = asr_hub.start(&addr(&config, Source::Asr)).await.unwrap();

    let bridge = BridgeStage::new(&config);
    let bridge_handle = bridge.hub().start(&addr(&config, Source::Bridge)).await.unwrap();
    tokio::spawn(bridge.run(cancel.clone()));

    let (mut observer, _) = connect_async(bridge_handle.url()).await.unwrap();
    wait_for_connections(&asr_hub, 1).await;

    asr_hub.broadcast(&Envelope::status(Source::Asr, "one", json!({}))).await;
    asr_hub.broadcast(&Envelope::status(Source::Asr, "two", json!({}))).await;
    let first = next_of_kind(&mut observer, MessageType::Status).await;
    let second = next_of_kind(&mut observer, MessageType::Status).await;
    assert_eq!(first.get("status"), Some(&json!("one")));
    assert_eq!(bridge_seq(&second), Some(bridge_seq(&first).unwrap() + 1));

    observer
        .send(Message::Text(Envelope::ping(Source::Client).to_json().unwrap().into()))
        .await
        .unwrap();
    let pong = next_of_kind(&mut observer, MessageType::Pong).await;
    assert_eq!(pong.source(), &Source::Bridge);
    assert_eq!(pong.get("services"), Some(&json!(["asr", "slm", "t2i"])));

    cancel.cancel();
    bridge_handle.stop().await;
    asr_handle.stop().await;
}

#[tokio::test]
async fn test_bridge_routes_config_update_to_named_stage() {
    let config = local_config();
    let cancel = CancellationToken::new();

    let (slm_tx, mut slm_rx) = mpsc::unbounded_channel::<Envelope>();
    let slm_hub = Hub::with_handler(Source::Slm, Arc::new(slm_tx));
    let slm_handle = slm_hub.start(&addr(&config, Source::Slm)).await.unwrap();

    let bridge = BridgeStage::new(&config);
    let bridge_handle = bridge.hub().start(&addr(&config, Source::Bridge)).await.unwrap();
    tokio::spawn(bridge.run(cancel.clone()));

    let (mut observer, _) = connect_async(bridge_handle.url()).await.unwrap();
    wait_for_connections(&slm_hub, 1).await;

    for service in ["state", "slm"] {
        let update = Envelope::from_payload(
            Source::Client,
            &ConfigUpdate {
                service: service.into(),
                param: "temperature".into(),
                value: json!(0.7),
            },
        );
        observer
            .send(Message::Text(update.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    let routed = tokio::time::timeout(Duration::from_secs(2), slm_rx.recv())
        .await
        .expect("config update not forwarded")
        .unwrap();
    let routed: ConfigUpdate = routed.decode().unwrap();
    assert_eq!(routed.service, "slm");
    assert_eq!(routed.param, "temperature");
    // the update for the unsubscribed stage went nowhere
    assert!(slm_rx.try_recv().is_err());

    cancel.cancel();
    bridge_handle.stop().await;
    slm_handle.stop().await;
}
