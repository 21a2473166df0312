//! `ruleguard rules`

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::Workspace;
use super::run::ReportFormat;
use crate::cli::{Globals, Output};
use crate::rules::Severity;

#[derive(Args, Debug)]
pub struct RulesArgs {
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

#[derive(Serialize)]
struct RuleListing<'a> {
    id: &'a str,
    severity: Severity,
    description: &'a str,
    depends_on: Vec<&'a str>,
    reads: &'a [String],
}

pub async fn execute(args: RulesArgs, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let registry = workspace.registry()?;

    let listing: Vec<RuleListing> = registry
        .iter()
        .map(|rule| RuleListing {
            id: &rule.id,
            severity: rule.severity,
            description: &rule.description,
            depends_on: rule.depends_on.iter().map(String::as_str).collect(),
            reads: registry.read_set(&rule.id),
        })
        .collect();

    if args.format == ReportFormat::Json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    output.header(&format!("Rule catalog ({} rules)", listing.len()));
    for rule in &listing {
        output.step(&format!("{} [{}]", rule.id, rule.severity));
        if !rule.description.is_empty() {
            output.indent(rule.description);
        }
        if !rule.depends_on.is_empty() {
            output.indent(&format!("depends on: {}", rule.depends_on.join(", ")));
        }
        output.indent(&format!("reads: {}", rule.reads.join(", ")));
    }
    Ok(())
}
