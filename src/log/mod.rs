//! Logging bootstrap.
//!
//! A `log4rs.yml` in the working directory wins; otherwise the embedded defaults are used.
//! Both may refer to the `structured_console` encoder, which appends record key-values to
//! the pattern output.

pub mod structured_console_encoder;

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use log4rs::{
    Config,
    config::{Deserializers, RawConfig},
};

use crate::log::structured_console_encoder::StructuredConsoleEncoderDeserializer;

pub const LOG_CONFIG_FILE: &str = "log4rs.yml";

fn deserializers() -> Deserializers {
    let mut deserializers = Deserializers::default();
    deserializers.insert("structured_console", StructuredConsoleEncoderDeserializer);
    deserializers
}

/// Builds the logging configuration from the embedded YAML.
fn embedded_config() -> Result<Config> {
    let yaml_content = include_str!("../../resources/default_log4rs.yml");
    let raw_config: RawConfig =
        serde_yaml::from_str(yaml_content).context("Embedded logging configuration is invalid YAML")?;

    let (appenders, errors) = raw_config.appenders_lossy(&deserializers());
    if !errors.is_empty() {
        return Err(anyhow!("Errors parsing embedded appenders: {:?}", errors));
    }

    Config::builder()
        .appenders(appenders)
        .loggers(raw_config.loggers())
        .build(raw_config.root())
        .context("Failed to build logging config")
}

/// Initializes logging
pub fn init_logging() -> Result<()> {
    let path = Path::new(LOG_CONFIG_FILE);

    if path.exists() {
        log4rs::init_file(path, deserializers())
            .with_context(|| format!("Failed to load external {}", LOG_CONFIG_FILE))?;
        info!(path = LOG_CONFIG_FILE; "Logging initialized from external configuration");
        return Ok(());
    }

    log4rs::init_config(embedded_config()?).context("Failed to initialize logging from embedded config")?;
    debug!("Logging initialized from embedded defaults (no external log4rs.yml found)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_configuration_builds() {
        let config = embedded_config().unwrap();
        assert_eq!(config.appenders().len(), 1);
        assert_eq!(config.root().level(), log::LevelFilter::Info);
    }
}
