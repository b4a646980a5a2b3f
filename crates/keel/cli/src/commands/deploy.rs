//! `keel deploy`

use super::{cancel_on_interrupt, print_progress, CommandContext};
use crate::error::CliResult;
use crate::gate::{OperatorGate, PromptMode};
use crate::output::{self, print_error, print_info, print_success, status_label, OutputFormat};
use crate::stackset;
use clap::Args;
use keel_deployer::{DeployReport, StackOutcome};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::Tabled;

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Stack set file
    pub file: PathBuf,

    /// Approve every risky change set
    #[arg(long)]
    pub auto_approve: bool,

    /// Approve the change set with this fingerprint (or its 12-char prefix)
    #[arg(long = "approve", value_name = "FINGERPRINT")]
    pub approvals: Vec<String>,
}

/// Table row for a stack outcome
#[derive(Debug, Serialize, Tabled)]
struct OutcomeRow {
    stack: String,
    status: String,
    state: String,
    changes: usize,
    risky: usize,
    #[tabled(rename = "change set")]
    change_set: String,
    error: String,
}

impl From<&StackOutcome> for OutcomeRow {
    fn from(o: &StackOutcome) -> Self {
        Self {
            stack: o.stack_id.to_string(),
            status: o.status.to_string(),
            state: o.state.to_string(),
            changes: o.changes,
            risky: o.risky,
            change_set: o
                .fingerprint
                .as_deref()
                .map(|f| f[..f.len().min(12)].to_string())
                .unwrap_or_default(),
            error: o.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        }
    }
}

/// Deploy a stack set; returns the process exit code.
pub async fn execute(args: DeployArgs, ctx: &CommandContext, format: OutputFormat) -> CliResult<i32> {
    let stacks = stackset::load(&args.file)?;

    let mode = if std::io::stdin().is_terminal() && !args.auto_approve {
        PromptMode::Interactive(ctx.config.approval_timeout())
    } else {
        PromptMode::Never
    };
    let gate = Arc::new(OperatorGate::new(args.auto_approve, args.approvals, mode));

    let orchestrator = ctx.orchestrator(gate, cancel_on_interrupt()).await?;
    print_info(&format!(
        "Deploying {} stack(s) from {}",
        stacks.len(),
        args.file.display()
    ));

    let progress = print_progress(orchestrator.subscribe());
    let result = orchestrator.deploy(&stacks).await;
    drop(orchestrator);
    let _ = progress.await;

    let report = result?;
    print_report(&report, format)?;
    Ok(report.exit_code())
}

fn print_report(report: &DeployReport, format: OutputFormat) -> CliResult<()> {
    let rows: Vec<OutcomeRow> = report.outcomes.iter().map(OutcomeRow::from).collect();
    output::print_output(rows, format)?;

    for outcome in &report.outcomes {
        if let Some(err) = &outcome.error {
            print_error(&format!("{} ({}): {}", outcome.stack_id, status_label(outcome.status), err));
        }
    }
    if report.is_success() {
        print_success(&format!(
            "Stack set deployed in {:.1}s",
            report.elapsed.as_secs_f64()
        ));
    }
    Ok(())
}
