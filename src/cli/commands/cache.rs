//! `ruleguard cache`

use anyhow::Result;
use clap::Subcommand;

use super::Workspace;
use crate::cli::{Globals, Output};
use crate::shared::unix_millis;

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache size and stored results
    Stats,
    /// Drop every cached result
    Clear,
    /// Drop the cached result of one rule
    Invalidate {
        /// Rule id
        rule: String,
    },
}

pub async fn execute(cmd: CacheCommands, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let cache = workspace.cache();

    match cmd {
        CacheCommands::Stats => {
            let stats = cache.stats();
            let now = unix_millis();
            output.header("Result cache");
            if let Some(path) = cache.path() {
                output.table_row("Location", &path.display().to_string());
            }
            output.table_row("Entries", &stats.entries.to_string());
            output.table_row("Size", &format!("{} bytes", stats.bytes));
            output.table_row("Limit", &format!("{} bytes", cache.settings().max_bytes));
            for entry in cache.entries() {
                let state = if entry.is_expired(now) { "expired" } else { "valid" };
                output.verbose(&format!(
                    "{} ({}, {} inputs, {} bytes)",
                    entry.rule_id,
                    state,
                    entry.file_hashes.len(),
                    entry.size_bytes
                ));
            }
        }
        CacheCommands::Clear => {
            let removed = cache.clear();
            cache.save()?;
            output.success(&format!("Removed {removed} cached results"));
        }
        CacheCommands::Invalidate { rule } => {
            if cache.invalidate(&rule) {
                cache.save()?;
                output.success(&format!("Invalidated cached result of {rule}"));
            } else {
                output.info(&format!("No cached result for {rule}"));
            }
        }
    }
    Ok(())
}
