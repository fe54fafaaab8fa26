use std::{fs, fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use config::{Config, Environment};
use log::info;

use super::IndexerConfig;

/// Environment prefix for overrides, e.g. `INDEXER_WORKERS=8`.
pub const ENV_PREFIX: &str = "INDEXER";

pub fn get_default_config() -> &'static str {
    include_str!("../../config/config.toml")
}

/// Reads the configuration at `path`, writing the embedded defaults there first if the file
/// does not exist. Environment variables override file values.
pub fn load_configuration(path: &Path) -> Result<IndexerConfig> {
    if !path.exists() {
        write_config_to(path, get_default_config()).context("Could not create default config")?;
        info!(path:% = path.display(); "Created new configuration file");
    }

    let filename = path.to_str().context("Invalid config file path")?;

    let cfg = Config::builder()
        .add_source(config::File::with_name(filename))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("rpc_urls")
                .try_parsing(true),
        )
        .build()
        .context("Could not build config")?;

    let parsed: IndexerConfig = cfg.try_deserialize().context("Invalid configuration")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn write_config_to(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create parent directories")?;
    };

    let mut file = File::create(path).context("Failed to create config file")?;
    file.write_all(source.as_bytes())
        .context("Failed to write config content")?;
    file.write_all(b"\n").context("Failed to write newline")?;
    Ok(())
}
