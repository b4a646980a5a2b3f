//! Output formatting utilities

use crate::error::CliResult;
use colored::*;
use keel_deployer::OutcomeStatus;
use keel_types::StackState;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Print a vector of items in the specified format
pub fn print_output<T: Serialize + Tabled>(data: Vec<T>, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No results".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&data)?),
    }
    Ok(())
}

/// Print a single item in the specified format
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?)
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
    }
    Ok(())
}

/// Tone of a one-line status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Success,
    Error,
    Warning,
    Info,
}

impl Tone {
    fn marker(self) -> ColoredString {
        match self {
            Tone::Success => "ok".green().bold(),
            Tone::Error => "error".red().bold(),
            Tone::Warning => "warning".yellow().bold(),
            Tone::Info => "info".blue(),
        }
    }
}

fn status_line(tone: Tone, message: &str) -> String {
    format!("{}: {}", tone.marker(), message)
}

pub fn print_success(message: &str) {
    println!("{}", status_line(Tone::Success, message));
}

/// Written to stderr.
pub fn print_error(message: &str) {
    eprintln!("{}", status_line(Tone::Error, message));
}

pub fn print_warning(message: &str) {
    println!("{}", status_line(Tone::Warning, message));
}

pub fn print_info(message: &str) {
    println!("{}", status_line(Tone::Info, message));
}

/// Stack state coloured for progress lines
pub fn state_label(state: StackState) -> ColoredString {
    let text = state.to_string();
    let text = text.as_str();
    match state {
        StackState::Deployed => text.green(),
        StackState::Failed => text.red(),
        StackState::AwaitingReview | StackState::RollingBack => text.yellow(),
        _ => text.normal(),
    }
}

/// Outcome status coloured for summaries
pub fn status_label(status: OutcomeStatus) -> ColoredString {
    let text = status.to_string();
    let text = text.as_str();
    match status {
        OutcomeStatus::Deployed | OutcomeStatus::Unchanged => text.green(),
        OutcomeStatus::Skipped => text.dimmed(),
        OutcomeStatus::RolledBack | OutcomeStatus::Rejected => text.yellow(),
        OutcomeStatus::Failed => text.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_default() {
        let format = OutputFormat::default();
        assert!(matches!(format, OutputFormat::Table));
    }

    #[test]
    fn test_status_line_names_its_tone() {
        colored::control::set_override(false);
        assert_eq!(status_line(Tone::Error, "cycle a -> b -> a"), "error: cycle a -> b -> a");
        assert_eq!(status_line(Tone::Success, "done"), "ok: done");
    }
}
