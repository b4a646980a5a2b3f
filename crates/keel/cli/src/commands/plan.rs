//! `keel plan`

use super::CommandContext;
use crate::error::CliResult;
use crate::output::{self, print_info, print_warning, OutputFormat};
use crate::stackset;
use clap::Args;
use keel_review::{ChangeItem, ChangeSet, RejectRisky};
use keel_types::StackId;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::Tabled;

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Stack set file
    pub file: PathBuf,

    /// Stack to plan
    #[arg(short, long)]
    pub stack: String,
}

/// Table row for a change item
#[derive(Debug, Serialize, Tabled)]
struct ChangeRow {
    resource: String,
    #[tabled(rename = "type")]
    resource_type: String,
    action: String,
    risky: String,
    attributes: String,
    reasons: String,
}

impl From<&ChangeItem> for ChangeRow {
    fn from(item: &ChangeItem) -> Self {
        Self {
            resource: item.resource_id.to_string(),
            resource_type: item.resource_type.clone(),
            action: item.action.to_string(),
            risky: if item.risky { "yes".into() } else { String::new() },
            attributes: item
                .changes
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            reasons: item.reasons.join("; "),
        }
    }
}

pub async fn execute(args: PlanArgs, ctx: &CommandContext, format: OutputFormat) -> CliResult<()> {
    let stacks = stackset::load(&args.file)?;
    let (_, cancel) = tokio::sync::watch::channel(false);
    let orchestrator = ctx.orchestrator(Arc::new(RejectRisky), cancel).await?;
    let change_set = orchestrator
        .plan(&stacks, &StackId::new(args.stack))
        .await?;

    match format {
        OutputFormat::Table => print_table(&change_set),
        _ => output::print_single(&change_set, format),
    }
}

fn print_table(change_set: &ChangeSet) -> CliResult<()> {
    if change_set.is_empty() {
        print_info(&format!("{}: no changes", change_set.stack_id()));
        return Ok(());
    }
    let rows: Vec<ChangeRow> = change_set.items().iter().map(ChangeRow::from).collect();
    output::print_output(rows, OutputFormat::Table)?;
    println!("Change set: {}", change_set.fingerprint());
    if change_set.is_risky() {
        print_warning(&format!(
            "{} risky change(s); approve with --approve {}",
            change_set.risky_items().count(),
            change_set.short_fingerprint()
        ));
    }
    Ok(())
}
