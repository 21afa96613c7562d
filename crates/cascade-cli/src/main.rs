mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cascade_bus::{Hub, HubHandle, Spoke, handler_fn};
use cascade_core::config::{Config, StageEndpoint, StagesConfig};
use cascade_core::protocol::ConfigUpdate;
use cascade_core::{Envelope, MessageType, Source};
use cascade_flow::SystemClock;
use cascade_stages::{
    AsrStage, BridgeStage, ComfyUiGenerator, OllamaExtractor, SlmStage, T2iStage,
};

#[derive(Parser)]
#[command(
    name = "cascade",
    about = "Speech to keywords to images, one WebSocket stage at a time",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.cascade/config.json5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serve Prometheus metrics on this port
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    metrics_port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the speech stage, reading transcribed lines from stdin
    Asr {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the language stage
    Slm {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the image generation stage
    T2i {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the bridge for external observers
    Bridge {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print every envelope a stage broadcasts
    Watch {
        /// asr, slm, state, t2i or bridge
        stage: String,
    },

    /// Send one envelope to a stage
    Send {
        stage: String,
        #[command(subcommand)]
        message: SendMessage,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SendMessage {
    /// Change a runtime parameter
    ConfigUpdate {
        /// Stage the parameter belongs to (default: the stage sent to)
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        param: String,
        /// JSON value; bare words are sent as strings
        #[arg(long)]
        value: String,
    },
    /// Ask for a pong
    Ping,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    #[cfg(feature = "metrics")]
    if let Some(port) = cli.metrics_port {
        cascade_bus::metrics::install_prometheus_exporter(port)?;
        tracing::info!(port, "Metrics exporter listening");
    }

    match cli.command {
        Commands::Asr { port } => {
            override_port(&mut config, &Source::Asr, port);
            let stage = AsrStage::new(&config, Arc::new(SystemClock));
            let handle = start_hub(&config, &Source::Asr, stage.hub()).await?;
            let cancel = shutdown_token(&handle);

            let (units_tx, units_rx) = mpsc::channel(64);
            tokio::spawn(read_stdin_lines(units_tx));
            stage.run(units_rx, cancel).await;
            handle.stop().await;
        }
        Commands::Slm { port } => {
            override_port(&mut config, &Source::Slm, port);
            let extractor = Arc::new(OllamaExtractor::from_config(&config.slm()));
            let stage = SlmStage::new(&config, extractor);
            let handle = start_hub(&config, &Source::Slm, stage.hub()).await?;
            let cancel = shutdown_token(&handle);
            stage.run(cancel).await;
            handle.stop().await;
        }
        Commands::T2i { port } => {
            override_port(&mut config, &Source::T2i, port);
            let generator = Arc::new(ComfyUiGenerator::from_config(&config.t2i()));
            let stage = T2iStage::new(&config, generator, Arc::new(SystemClock));
            let handle = start_hub(&config, &Source::T2i, stage.hub()).await?;
            let cancel = shutdown_token(&handle);
            stage.run(cancel).await;
            handle.stop().await;
        }
        Commands::Bridge { port } => {
            override_port(&mut config, &Source::Bridge, port);
            let stage = BridgeStage::new(&config);
            let handle = start_hub(&config, &Source::Bridge, stage.hub()).await?;
            let cancel = shutdown_token(&handle);
            stage.run(cancel).await;
            handle.stop().await;
        }
        Commands::Watch { stage } => watch(&config, parse_stage(&stage)?).await?,
        Commands::Send { stage, message } => {
            send(&config, parse_stage(&stage)?, message).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", config_path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} error(s) in {}", errors.len(), config_path.display());
                }
                println!("{} is valid", config_path.display());
            }
        },
    }

    Ok(())
}

fn parse_stage(name: &str) -> anyhow::Result<Source> {
    let stage = Source::from(name);
    anyhow::ensure!(
        Source::STAGES.contains(&stage),
        "unknown stage '{name}' (expected asr, slm, state, t2i or bridge)"
    );
    Ok(stage)
}

fn override_port(config: &mut Config, stage: &Source, port: Option<u16>) {
    let Some(port) = port else {
        return;
    };
    let mut endpoint = config.endpoint(stage);
    endpoint.port = port;
    let stages = config.stages.get_or_insert_with(StagesConfig::default);
    let slot: &mut Option<StageEndpoint> = match stage {
        Source::Asr => &mut stages.asr,
        Source::Slm => &mut stages.slm,
        Source::State => &mut stages.state,
        Source::T2i => &mut stages.t2i,
        Source::Bridge => &mut stages.bridge,
        _ => return,
    };
    *slot = Some(endpoint);
}

async fn start_hub(config: &Config, stage: &Source, hub: &Hub) -> anyhow::Result<HubHandle> {
    let addr = config.endpoint(stage).listen_addr();
    let handle = hub.start(&addr).await?;
    tracing::info!(stage = %stage, url = %handle.url(), "Stage listening");
    Ok(handle)
}

/// A token cancelled on Ctrl-C.
fn shutdown_token(handle: &HubHandle) -> CancellationToken {
    let cancel = handle.cancel_token().child_token();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        on_signal.cancel();
    });
    cancel
}

async fn read_stdin_lines(units: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if units.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%e, "Reading stdin failed");
                break;
            }
        }
    }
}

async fn watch(config: &Config, stage: Source) -> anyhow::Result<()> {
    let spoke = Spoke::with_handler(
        Source::Client,
        stage.clone(),
        config.endpoint(&stage).url(),
        config.reconnect_delay(),
        handler_fn(|envelope: Envelope| async move {
            println!("{}", envelope.to_json()?);
            Ok(())
        }),
    );
    tracing::info!(stage = %stage, url = %spoke.url(), "Watching");

    let runner = {
        let spoke = spoke.clone();
        tokio::spawn(async move { spoke.run_forever().await })
    };
    tokio::signal::ctrl_c().await?;
    spoke.close().await;
    let _ = runner.await;
    Ok(())
}

/// Parse `--value`: JSON if it parses, a plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn send(config: &Config, stage: Source, message: SendMessage) -> anyhow::Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let spoke = Spoke::with_handler(
        Source::Client,
        stage.clone(),
        config.endpoint(&stage).url(),
        config.reconnect_delay(),
        Arc::new(events_tx),
    );
    anyhow::ensure!(spoke.connect().await, "cannot reach {stage} at {}", spoke.url());

    let runner = {
        let spoke = spoke.clone();
        tokio::spawn(async move { spoke.run_forever().await })
    };

    let result = match message {
        SendMessage::ConfigUpdate {
            service,
            param,
            value,
        } => {
            let update = ConfigUpdate {
                service: service.unwrap_or_else(|| stage.as_str().to_string()),
                param,
                value: parse_value(&value),
            };
            let envelope = Envelope::from_payload(Source::Client, &update);
            anyhow::ensure!(spoke.send(&envelope).await, "send to {stage} failed");
            println!("{}", envelope.to_json()?);
            Ok(())
        }
        SendMessage::Ping => {
            anyhow::ensure!(
                spoke.send(&Envelope::ping(Source::Client)).await,
                "send to {stage} failed"
            );
            wait_for_pong(&mut events).await
        }
    };

    spoke.close().await;
    let _ = runner.await;
    result
}

async fn wait_for_pong(events: &mut mpsc::UnboundedReceiver<Envelope>) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(envelope)) if envelope.kind() == &MessageType::Pong => {
                println!("{}", envelope.to_json()?);
                return Ok(());
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => anyhow::bail!("no pong within 3s"),
        }
    }
}
