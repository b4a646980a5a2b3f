//! `keel status`

use super::CommandContext;
use crate::error::CliResult;
use crate::output::{self, OutputFormat};
use keel_registry::RegistrySnapshot;
use keel_state::{StackSnapshot, StateStore};
use serde::Serialize;
use tabled::Tabled;

/// Table row for a persisted stack
#[derive(Debug, Serialize, Tabled)]
struct StackRow {
    stack: String,
    state: String,
    generation: u64,
    groups: String,
    exports: usize,
    updated: String,
}

impl From<&StackSnapshot> for StackRow {
    fn from(s: &StackSnapshot) -> Self {
        let groups = s
            .groups
            .iter()
            .map(|g| {
                format!(
                    "{} {}/{} @ {}",
                    g.id,
                    g.in_service_count(),
                    g.desired_capacity,
                    g.launch_version
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            stack: s.stack_id.to_string(),
            state: s.state.to_string(),
            generation: s.generation,
            groups,
            exports: s.exports.len(),
            updated: s.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Table row for a published export
#[derive(Debug, Serialize, Tabled)]
struct ExportRow {
    export: String,
    owner: String,
    value: String,
    revision: u64,
    consumers: String,
}

fn export_rows(registry: &RegistrySnapshot) -> Vec<ExportRow> {
    registry
        .exports
        .values()
        .map(|e| ExportRow {
            export: e.name.to_string(),
            owner: e.owner.to_string(),
            value: e.value.clone(),
            revision: e.revision,
            consumers: registry
                .locks
                .get(&e.name)
                .map(|c| c.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))
                .unwrap_or_default(),
        })
        .collect()
}

#[derive(Serialize)]
struct StatusDocument<'a> {
    stacks: &'a [StackSnapshot],
    registry: &'a RegistrySnapshot,
}

pub async fn execute(ctx: &CommandContext, format: OutputFormat) -> CliResult<()> {
    let store = ctx.open_store().await?;
    let stacks = store.list_stacks().await?;
    let registry = store.load_registry().await?;

    match format {
        OutputFormat::Table => {
            println!("Stacks ({})", ctx.state_dir.display());
            output::print_output(stacks.iter().map(StackRow::from).collect(), format)?;
            println!();
            println!("Exports");
            output::print_output(export_rows(&registry), format)
        }
        _ => output::print_single(
            &StatusDocument {
                stacks: &stacks,
                registry: &registry,
            },
            format,
        ),
    }
}
