//! Instance launchers
//!
//! The seam to the compute provider: create a unit from a launch version,
//! or destroy one.

use crate::completion::CompletionSignals;
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use keel_types::{CapacityGroup, InstanceId, InstanceUnit, LaunchVersion};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Creates and destroys instance units
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Launch one unit of `group` from `version`. The returned unit is
    /// Pending and must be tracked by the caller immediately.
    async fn launch(
        &self,
        group: &CapacityGroup,
        version: &LaunchVersion,
        now: DateTime<Utc>,
    ) -> Result<InstanceUnit>;

    /// Destroy a unit.
    async fn terminate(&self, group: &CapacityGroup, unit: &InstanceId) -> Result<()>;
}

/// In-process launcher for tests and offline runs
#[derive(Default)]
pub struct SimulatedLauncher {
    launched: AtomicU32,
    terminated: AtomicU32,
    refused_versions: DashSet<LaunchVersion>,
    auto_signal: Option<Arc<CompletionSignals>>,
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal success for every launched unit, as a bootstrap script would.
    pub fn with_auto_signal(mut self, signals: Arc<CompletionSignals>) -> Self {
        self.auto_signal = Some(signals);
        self
    }

    /// Fail every launch of `version`.
    pub fn refuse_version(&self, version: impl Into<LaunchVersion>) {
        self.refused_versions.insert(version.into());
    }

    pub fn launched(&self) -> u32 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> u32 {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceLauncher for SimulatedLauncher {
    async fn launch(
        &self,
        group: &CapacityGroup,
        version: &LaunchVersion,
        now: DateTime<Utc>,
    ) -> Result<InstanceUnit> {
        if self.refused_versions.contains(version) {
            return Err(RolloutError::Launch {
                group: group.id.clone(),
                reason: format!("launch version {} was refused", version),
            });
        }
        let unit = InstanceUnit::launch(version.clone(), now);
        self.launched.fetch_add(1, Ordering::SeqCst);
        if let Some(signals) = &self.auto_signal {
            signals.signal_success(&unit.id);
        }
        Ok(unit)
    }

    async fn terminate(&self, _group: &CapacityGroup, _unit: &InstanceId) -> Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
