use std::path::Path;

use anyhow::Context;
use clap::Parser;

use streamgate::config::{Config, ConfigFile, CONFIG_ENV, DEFAULT_CONFIG};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing)
    let config_file_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = Path::new(&config_file_path);
    if config_path.exists() {
        let file_cfg = ConfigFile::load(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        file_cfg.inject_env();
    }

    let config = Config::parse();
    streamgate::app::run(config).await
}
