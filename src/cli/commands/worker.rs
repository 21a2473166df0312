//! Hidden `ruleguard worker --rule <id>`
//!
//! Child side of process isolation: evaluate one rule and print exactly one
//! result envelope on stdout. A panic exits non-zero and the parent records a
//! crash.

use anyhow::{Result, anyhow};
use clap::Args;

use super::Workspace;
use crate::cli::Globals;
use crate::engine::transport::{encode_error, encode_result};
use crate::rules::RuleContext;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Rule to evaluate
    #[arg(long, value_name = "ID")]
    pub rule: String,
}

pub async fn execute(args: WorkerArgs, globals: &Globals) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let registry = workspace.registry()?;

    let envelope = match registry.get(&args.rule) {
        None => encode_error(&args.rule, &anyhow!("rule '{}' is not registered", args.rule))?,
        Some(rule) => {
            let context = RuleContext::new(workspace.snapshot());
            match rule.evaluate(&context) {
                Ok(mut result) => {
                    result.rule_id = rule.id.clone();
                    encode_result(result)?
                }
                Err(e) => encode_error(&rule.id, &e)?,
            }
        }
    };

    println!("{envelope}");
    Ok(())
}
