//! `ruleguard affected`

use anyhow::Result;
use clap::Args;

use super::run::ReportFormat;
use super::{Workspace, change_base};
use crate::cli::{Globals, Output};

#[derive(Args, Debug)]
pub struct AffectedArgs {
    /// Compare against this ref instead of the working tree
    #[arg(long, value_name = "REF")]
    pub base: Option<String>,

    /// End of the compared range (defaults to the working tree)
    #[arg(long, value_name = "REF", requires = "base")]
    pub target: Option<String>,

    /// Only consider staged changes
    #[arg(long, conflicts_with = "base")]
    pub staged: bool,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

pub async fn execute(args: AffectedArgs, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let orchestrator = workspace.orchestrator()?;
    let base = change_base(args.base, args.target, args.staged);
    let changes = orchestrator.detect_changes(&base)?;

    if args.format == ReportFormat::Json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    output.header(&format!("Changes against {base}"));
    output.table_row("Changed files", &changes.changed.len().to_string());
    for path in &changes.changed {
        output.verbose(&format!("  {path}"));
    }

    if let Some(reason) = &changes.full {
        output.warning(&format!("Incremental run would widen to all rules: {reason}"));
        return Ok(());
    }
    if changes.closed.is_empty() {
        output.success("No rules affected");
        return Ok(());
    }

    output.section_header("Affected rules");
    for id in &changes.closed {
        if changes.direct.contains(id) {
            output.list_item(id);
        } else {
            output.list_item(&format!("{id}  (via dependency)"));
        }
    }
    Ok(())
}
