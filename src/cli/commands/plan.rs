//! `ruleguard plan`

use anyhow::Result;
use clap::Args;

use super::Workspace;
use super::run::ReportFormat;
use crate::cli::{Globals, Output};
use crate::plan::plan;

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

pub async fn execute(args: PlanArgs, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let registry = workspace.registry()?;
    let batches = plan(&registry.ids(), &registry.edges())?;

    if args.format == ReportFormat::Json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
        return Ok(());
    }

    output.header(&format!(
        "Execution plan: {} rules in {} batches",
        batches.rule_count(),
        batches.batches.len()
    ));
    for batch in &batches.batches {
        output.section_header(&format!("Batch {}", batch.layer));
        for id in &batch.rule_ids {
            let deps: Vec<&str> = registry
                .get(id)
                .map(|rule| rule.depends_on.iter().map(String::as_str).collect())
                .unwrap_or_default();
            if deps.is_empty() {
                output.list_item(id);
            } else {
                output.list_item(&format!("{id}  (after {})", deps.join(", ")));
            }
        }
    }
    Ok(())
}
