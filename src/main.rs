use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use cachemesh::config;
use cachemesh::logging;
use cachemesh::server;

#[derive(Parser, Debug)]
#[command(name = "cachemesh", about = "Distributed HTTP caching reverse proxy", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;

    if cfg.hostname.is_none() {
        cfg.hostname = std::env::var("HOSTNAME").ok();
    }

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    log::info!("cachemesh starting with config {}", cli.config.display());

    server::run(Arc::new(cfg)).await
}
