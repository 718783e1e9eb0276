//! Config command implementation.

use anyhow::{Context, Result};

use beambox_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: &ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = super::load_config();
            config
                .validate()
                .context("Configuration file has invalid values")?;
            let rendered = config.to_toml().context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }
    }
    Ok(())
}
