use clap::Parser;

use safe_fetch::app;
use safe_fetch::config::{Config, ConfigFile, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing)
    let config_file_path =
        std::env::var("SAFE_FETCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("  WARNING: ignoring config file {}: {}", config_path.display(), e),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
