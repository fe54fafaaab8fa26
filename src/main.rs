use log::{error, info};
use neo_indexer::config::{config_path, load_configuration};
use neo_indexer::daemon::Daemon;
use neo_indexer::log::init_logging;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging()?;

    let path = config_path();
    let config = load_configuration(&path)?;
    info!(config:% = path.display(), label = &*config.label; "Configuration loaded");

    if let Err(e) = Daemon::new(config).run().await {
        error!(error:% = e; "Fatal error, exiting");
        std::process::exit(1);
    }
    Ok(())
}
