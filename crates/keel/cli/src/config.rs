//! CLI configuration
//!
//! Settings live in a TOML file (`$CONFIG_DIR/keel/config.toml` unless
//! `--config` / `KEEL_CONFIG` names another). Rollout timings and the
//! approval timeout have no built-in values: a command that needs one fails
//! with a configuration error naming the missing key.

use crate::error::{CliError, CliResult};
use keel_rollout::RolloutTimings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Directory holding the export registry and stack snapshots
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub rollout: RolloutConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,
}

/// `[rollout]` table
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RolloutConfig {
    /// Time between health polls of a batch
    pub poll_interval_ms: Option<u64>,

    /// Health polls per batch before it fails
    pub max_polls: Option<u32>,

    /// Hard limit on one batch's wait once its grace period has passed
    pub batch_wait_ceiling_secs: Option<u64>,
}

/// `[approval]` table
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApprovalConfig {
    /// How long an interactive approval prompt waits for an answer
    pub timeout_secs: Option<u64>,
}

impl CliConfig {
    /// Load configuration from file
    ///
    /// A missing default file yields an empty configuration; a missing file
    /// named explicitly is an error.
    pub fn load(path: Option<&Path>) -> CliResult<(Self, Option<PathBuf>)> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_config_path() {
                Some(p) => (p, false),
                None => return Ok((CliConfig::default(), None)),
            },
        };

        if !config_path.exists() {
            if explicit {
                return Err(CliError::Config(format!(
                    "config file {} does not exist",
                    config_path.display()
                )));
            }
            return Ok((CliConfig::default(), None));
        }

        let contents = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&contents)
            .map_err(|e| CliError::Config(format!("{}: {}", config_path.display(), e)))?;
        Ok((config, Some(config_path)))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Get the default configuration file path
    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("keel").join("config.toml"))
    }

    /// State directory, from `--state-dir`, the file, or the user data dir.
    pub fn state_dir(&self, flag: Option<&Path>) -> CliResult<PathBuf> {
        if let Some(dir) = flag.or(self.state_dir.as_deref()) {
            return Ok(dir.to_path_buf());
        }
        dirs::data_dir()
            .map(|dir| dir.join("keel"))
            .ok_or_else(|| CliError::Config("cannot determine a state directory; set state_dir".into()))
    }

    /// Rolling update timings; every key is required.
    pub fn rollout_timings(&self) -> CliResult<RolloutTimings> {
        let poll_interval = required(self.rollout.poll_interval_ms, "rollout.poll_interval_ms")?;
        let max_polls = required(self.rollout.max_polls, "rollout.max_polls")?;
        let ceiling = required(
            self.rollout.batch_wait_ceiling_secs,
            "rollout.batch_wait_ceiling_secs",
        )?;
        let timings = RolloutTimings::new(
            Duration::from_millis(poll_interval),
            max_polls,
            Duration::from_secs(ceiling),
        );
        timings
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(timings)
    }

    /// Approval prompt timeout, when configured.
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval.timeout_secs.map(Duration::from_secs)
    }
}

fn required<T>(value: Option<T>, key: &str) -> CliResult<T> {
    value.ok_or_else(|| CliError::Config(format!("{} is not set", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert!(config.state_dir.is_none());
        assert!(config.rollout.poll_interval_ms.is_none());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let err = CliConfig::load(Some(Path::new("/nonexistent/keel/config.toml"))).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_rollout_timings_required() {
        let config = CliConfig::parse(
            r#"
            [rollout]
            poll_interval_ms = 500
            max_polls = 40
            "#,
        )
        .unwrap();
        let err = config.rollout_timings().unwrap_err();
        assert!(err.to_string().contains("rollout.batch_wait_ceiling_secs"));

        let config = CliConfig::parse(
            r#"
            state_dir = "/var/lib/keel"

            [rollout]
            poll_interval_ms = 500
            max_polls = 40
            batch_wait_ceiling_secs = 900

            [approval]
            timeout_secs = 120
            "#,
        )
        .unwrap();
        let timings = config.rollout_timings().unwrap();
        assert_eq!(timings.poll_interval, Duration::from_millis(500));
        assert_eq!(timings.max_polls, 40);
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(
            config.state_dir(None).unwrap(),
            PathBuf::from("/var/lib/keel")
        );
        assert_eq!(
            config.state_dir(Some(Path::new("/tmp/keel"))).unwrap(),
            PathBuf::from("/tmp/keel")
        );
    }

    #[test]
    fn test_zero_timings_rejected() {
        let config = CliConfig::parse(
            r#"
            [rollout]
            poll_interval_ms = 0
            max_polls = 40
            batch_wait_ceiling_secs = 900
            "#,
        )
        .unwrap();
        assert!(matches!(config.rollout_timings(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(CliConfig::parse("[rollout]\npause = 3\n").is_err());
    }
}
