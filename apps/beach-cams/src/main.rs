use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use beach_cams_core::config::Config;
use beach_cams_core::media::TracingSink;
use beach_cams_core::negotiation::WebRtcCapabilityFactory;
use beach_cams_core::registry::{SlotIndex, SlotRegistry};
use beach_cams_core::status::TracingReporter;
use beach_cams_core::telemetry::logging::{self, LogConfig, LogLevel};
use beach_cams_core::transport::WebSocketConnector;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "beach-cams", about = "Receive camera streams over WebRTC, one per slot")]
struct Cli {
    #[arg(long, env = "BEACH_CAMS_SIGNALING_URL", help = "Signaling server websocket URL")]
    signaling_url: Option<String>,

    #[arg(long, env = "BEACH_CAMS_SLOTS", help = "Number of slots")]
    slots: Option<usize>,

    #[arg(long = "source", value_name = "SLOT=ADDRESS", help = "Activate a slot at startup (repeatable)")]
    sources: Vec<SourceArg>,

    #[arg(long, value_enum, env = "BEACH_CAMS_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, env = "BEACH_CAMS_LOG_FILE", help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct SourceArg {
    slot: SlotIndex,
    address: String,
}

impl FromStr for SourceArg {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (slot, address) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected SLOT=ADDRESS, got {raw:?}"))?;
        let slot = slot
            .trim()
            .parse::<usize>()
            .map_err(|err| format!("invalid slot {slot:?}: {err}"))?;
        Ok(Self {
            slot: SlotIndex::new(slot),
            address: address.to_string(),
        })
    }
}

/// Activates every `--source`. A rejected entry only affects its own slot.
fn activate_sources(registry: &mut SlotRegistry, sources: &[SourceArg]) -> usize {
    let mut activated = 0;
    for source in sources {
        match registry.activate(source.slot, &source.address) {
            Ok(()) => activated += 1,
            Err(err) => tracing::error!(slot = %source.slot, error = %err, "skipping source"),
        }
    }
    activated
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(url) = cli.signaling_url.as_deref() {
        config = config.with_signaling_url(url);
    }
    if let Some(slots) = cli.slots {
        config = config.with_slot_count(slots);
    }

    let capabilities = WebRtcCapabilityFactory::new(config.ice_servers.clone())
        .context("failed to build webrtc api")?;
    let mut registry = SlotRegistry::new(
        config.registry_config()?,
        Arc::new(WebSocketConnector::new()),
        Arc::new(capabilities),
        Arc::new(TracingReporter),
        Arc::new(TracingSink::new()),
    );
    tracing::info!(
        url = %config.signaling_url,
        slots = config.slot_count,
        "beach-cams starting"
    );

    activate_sources(&mut registry, &cli.sources);

    registry
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    tracing::info!("beach-cams stopped");
    Ok(())
}
