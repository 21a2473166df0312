//! `ruleguard config`

use anyhow::Result;
use clap::Subcommand;

use super::Workspace;
use crate::cli::Globals;
use crate::config::ConfigFormat;
use crate::plan::plan;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration
    Show {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
        /// Only print this dotted section, e.g. `engine.cache`
        #[arg(long)]
        section: Option<String>,
    },
    /// Check that the configuration and rule catalog load and plan
    Validate,
}

pub async fn execute(cmd: ConfigCommands, globals: &Globals) -> Result<()> {
    let workspace = Workspace::load(globals)?;

    match cmd {
        ConfigCommands::Show { format, section: None } => {
            print!("{}", workspace.config.export(format)?);
        }
        ConfigCommands::Show {
            format,
            section: Some(section),
        } => {
            let value = workspace.config.get_section(&section)?;
            match format {
                ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
                ConfigFormat::Toml => print!("{}", toml::to_string_pretty(&value)?),
            }
        }
        ConfigCommands::Validate => {
            let registry = workspace.registry()?;
            let batches = plan(&registry.ids(), &registry.edges())?;
            if !globals.quiet {
                println!(
                    "Configuration is valid: {} rules in {} batches",
                    registry.len(),
                    batches.batches.len()
                );
            }
        }
    }
    Ok(())
}
