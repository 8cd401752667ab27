//! Selective-forwarding server entry point: parses CLI flags, installs
//! logging, and runs the UDP router / TCP control processor until killed.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use voicelink::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    let _log_guard = voicelink::init_logging(&config.log_dir, &config.log_level, "sfu_server")?;

    info!(?config, "starting sfu-server");
    voicelink::server::run(config).await?;
    Ok(())
}
