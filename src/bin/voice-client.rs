//! Headless client media engine driver: connects, captures, plays back, and
//! otherwise drives the same [`voicelink::client::ClientEngine`] a GUI shell
//! would — exposed as a CLI so the engine is scriptable/testable without one
//! (the GUI shell itself is out of scope).

use anyhow::Result;
use clap::Parser;
use tracing::info;

use voicelink::client::ClientEngine;
use voicelink::config::ClientConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();
    let _log_guard = voicelink::init_logging(&config.log_dir, &config.log_level, "voice_client")?;

    info!(room = %config.room, nickname = %config.nickname, "starting voice-client");
    let _engine = ClientEngine::start(config).await?;

    info!("client engine running, press ctrl-c to exit");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
