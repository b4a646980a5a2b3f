//! `keel teardown`

use super::{cancel_on_interrupt, print_progress, CommandContext};
use crate::error::CliResult;
use crate::gate::{OperatorGate, PromptMode};
use crate::output::{print_error, print_success};
use crate::stackset;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct TeardownArgs {
    /// Stack set file
    pub file: PathBuf,

    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

pub async fn execute(args: TeardownArgs, ctx: &CommandContext) -> CliResult<i32> {
    let stacks = stackset::load(&args.file)?;

    if !args.yes {
        let ids: Vec<&str> = stacks.iter().map(|s| s.id.as_str()).collect();
        let confirm = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Tear down {}? Every unit is terminated and every export retired.",
                ids.join(", ")
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            print_error("Aborted");
            return Ok(1);
        }
    }

    let gate = Arc::new(OperatorGate::new(false, Vec::new(), PromptMode::Never));
    let orchestrator = ctx.orchestrator(gate, cancel_on_interrupt()).await?;
    let progress = print_progress(orchestrator.subscribe());
    let result = orchestrator.teardown(&stacks).await;
    drop(orchestrator);
    let _ = progress.await;

    let report = result?;
    print_success(&format!(
        "Removed {} stack(s): {} unit(s) terminated, {} export(s) retired",
        report.removed.len(),
        report.units_terminated,
        report.exports_retired.len()
    ));
    Ok(0)
}
