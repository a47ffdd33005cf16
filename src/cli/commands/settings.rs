//! Config file commands.

use std::path::Path;

use super::ConfigCommand;
use crate::config::{self, Config, ConfigError};

/// Run a `config` subcommand.
pub fn cmd_config(config: &Config, path: Option<&Path>, action: &ConfigCommand) -> anyhow::Result<()> {
    match action {
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommand::Init { force } => {
            let path = match path {
                Some(path) => path.to_path_buf(),
                None => config::config_path().ok_or(ConfigError::NoConfigDir)?,
            };
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to replace it)", path.display());
            }
            config::save_to(&Config::default(), &path)?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}
