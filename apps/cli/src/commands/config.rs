//! Configuration loading and the config command.

use std::path::Path;

use anyhow::Context;
use teak_core::SdkConfig;

const DEFAULT_CONFIG_FILE: &str = "teak.toml";

/// Load `path`, or `./teak.toml` when present, or the defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<SdkConfig> {
    match path {
        Some(path) => SdkConfig::load(path).with_context(|| format!("failed to load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            SdkConfig::load(Path::new(DEFAULT_CONFIG_FILE)).context("failed to load teak.toml")
        }
        None => Ok(SdkConfig::default()),
    }
}

/// Print the effective configuration.
pub fn show(config: &SdkConfig) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
