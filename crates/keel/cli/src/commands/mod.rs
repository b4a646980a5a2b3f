//! CLI command implementations

pub mod deploy;
pub mod plan;
pub mod status;
pub mod teardown;

use crate::config::CliConfig;
use crate::error::CliResult;
use crate::output::state_label;
use colored::*;
use keel_deployer::{Orchestrator, SimulatedProvisioner};
use keel_health::{SignalBehaviour, SimulatedSignalSource, SystemClock};
use keel_review::ApprovalGate;
use keel_rollout::{CompletionSignals, RollingUpdateController, SimulatedLauncher};
use keel_state::FileStateStore;
use keel_types::{DeployEvent, DeployEventEnvelope, StackId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Settings shared by every command
pub struct CommandContext {
    pub config: CliConfig,
    pub config_path: Option<PathBuf>,
    pub state_dir: PathBuf,
}

impl CommandContext {
    pub async fn open_store(&self) -> CliResult<FileStateStore> {
        Ok(FileStateStore::open(&self.state_dir).await?)
    }

    /// Build an orchestrator over the offline provider.
    ///
    /// Units are simulated: they boot instantly, pass every health check and
    /// signal completion on launch.
    pub async fn orchestrator(
        &self,
        gate: Arc<dyn ApprovalGate>,
        cancel: watch::Receiver<bool>,
    ) -> CliResult<Orchestrator> {
        let timings = self.config.rollout_timings()?;
        let store = Arc::new(self.open_store().await?);
        info!(state_dir = %self.state_dir.display(), "Opened state directory");

        let completions = Arc::new(CompletionSignals::new());
        let launcher = SimulatedLauncher::new().with_auto_signal(completions.clone());
        let signals = SimulatedSignalSource::new(SignalBehaviour::Healthy {
            boot: Duration::ZERO,
        });
        let rollout = RollingUpdateController::new(
            Arc::new(launcher),
            Arc::new(signals),
            Arc::new(SystemClock),
            timings,
        )
        .with_completions(completions);

        Ok(Orchestrator::builder()
            .with_store(store)
            .with_provisioner(Arc::new(SimulatedProvisioner::new()))
            .with_rollout(rollout)
            .with_gate(gate)
            .with_cancel(cancel)
            .build()
            .await?)
    }
}

/// Flip the cancel flag on Ctrl-C.
pub fn cancel_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted; stopping after the current batch".yellow());
            let _ = tx.send(true);
        }
    });
    rx
}

/// Print lifecycle events until the orchestrator is dropped.
pub fn print_progress(mut events: broadcast::Receiver<DeployEventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => print_event(&envelope.event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("{}", format!("({} progress events skipped)", missed).as_str().dimmed());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn stack_label(stack_id: &StackId) -> ColoredString {
    format!("{:<20}", stack_id.as_str()).as_str().bold()
}

fn print_event(event: &DeployEvent) {
    match event {
        DeployEvent::StackTransition { stack_id, from, to } => {
            println!("  {} {} -> {}", stack_label(stack_id), from, state_label(*to));
        }
        DeployEvent::ChangeSetComputed {
            stack_id,
            fingerprint,
            items,
            risky,
        } => {
            let risky = if *risky > 0 {
                format!("{} risky", risky).as_str().yellow().to_string()
            } else {
                "0 risky".to_string()
            };
            println!(
                "  {} change set {} ({} items, {})",
                stack_label(stack_id),
                &fingerprint[..fingerprint.len().min(12)],
                items,
                risky
            );
        }
        DeployEvent::ExportsPublished { stack_id, exports } => {
            let names: Vec<&str> = exports.iter().map(|e| e.as_str()).collect();
            println!("  {} published {}", stack_label(stack_id), names.join(", "));
        }
        DeployEvent::BatchStarted {
            stack_id,
            group_id,
            batch,
            size,
            target_version,
        } => {
            println!(
                "  {} {} batch {}: launching {} unit(s) of {}",
                stack_label(stack_id),
                group_id,
                batch,
                size,
                target_version
            );
        }
        DeployEvent::BatchCompleted {
            stack_id,
            group_id,
            batch,
            in_service,
        } => {
            println!(
                "  {} {} batch {} verified, {} in service",
                stack_label(stack_id),
                group_id,
                batch,
                in_service
            );
        }
        DeployEvent::BatchFailed {
            stack_id,
            group_id,
            batch,
            reason,
            ..
        } => {
            println!(
                "  {} {} batch {} {}: {}",
                stack_label(stack_id),
                group_id,
                batch,
                "failed".red(),
                reason
            );
        }
        DeployEvent::StackTornDown { stack_id } => {
            println!("  {} {}", stack_label(stack_id), "removed".dimmed());
        }
    }
}
