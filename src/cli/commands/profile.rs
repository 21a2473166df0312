//! `ruleguard profile`

use anyhow::Result;
use clap::Subcommand;

use super::Workspace;
use crate::cli::{Globals, Output};

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Show recorded execution times
    Show,
    /// Forget recorded times for one rule, or for every rule
    Reset {
        /// Rule id; omit to reset everything
        rule: Option<String>,
    },
}

pub async fn execute(cmd: ProfileCommands, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let profiles = workspace.profiles();

    match cmd {
        ProfileCommands::Show => {
            let all = profiles.profiles();
            output.header(&format!("Execution profiles ({} rules)", all.len()));
            if all.is_empty() {
                output.info("No rule has been timed yet");
                return Ok(());
            }
            for profile in all {
                output.table_row(
                    &profile.rule_id,
                    &format!(
                        "mean {:.2}ms  sd {:.2}ms  min {:.2}ms  max {:.2}ms  n={}",
                        profile.mean_ms,
                        profile.std_dev(),
                        profile.min_ms,
                        profile.max_ms,
                        profile.count
                    ),
                );
            }
        }
        ProfileCommands::Reset { rule } => {
            let removed = profiles.reset(rule.as_deref());
            profiles.save()?;
            match rule {
                Some(rule) if removed == 0 => output.info(&format!("No profile for {rule}")),
                Some(rule) => output.success(&format!("Reset profile of {rule}")),
                None => output.success(&format!("Reset {removed} profiles")),
            }
        }
    }
    Ok(())
}
