//! Approval gate for operator runs
//!
//! Risky change sets pass when `--auto-approve` is given or their
//! fingerprint was approved with `--approve`. Otherwise the operator is
//! asked on the terminal; without a terminal the change set is rejected.

use async_trait::async_trait;
use keel_review::{ApprovalDecision, ApprovalGate, ChangeSet, Result, ReviewError};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// How unapproved risky change sets are decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Ask on the terminal, waiting at most this long
    Interactive(Option<Duration>),
    /// Reject without asking
    Never,
}

pub struct OperatorGate {
    auto_approve: bool,
    approved: BTreeSet<String>,
    mode: PromptMode,
    // One prompt at a time when a wave holds several risky stacks
    prompt_lock: Mutex<()>,
}

impl OperatorGate {
    pub fn new(auto_approve: bool, approved: impl IntoIterator<Item = String>, mode: PromptMode) -> Self {
        Self {
            auto_approve,
            approved: approved.into_iter().collect(),
            mode,
            prompt_lock: Mutex::new(()),
        }
    }

    fn is_preapproved(&self, change_set: &ChangeSet) -> bool {
        let fingerprint = change_set.fingerprint();
        self.approved
            .iter()
            .any(|a| a == fingerprint || (a.len() >= 12 && fingerprint.starts_with(a.as_str())))
    }

    async fn prompt(&self, change_set: &ChangeSet, timeout: Option<Duration>) -> Result<ApprovalDecision> {
        let Some(timeout) = timeout else {
            return Err(ReviewError::Gate {
                gate: self.name().to_string(),
                reason: "approval.timeout_secs is not set".into(),
            });
        };
        let _turn = self.prompt_lock.lock().await;

        let risky: Vec<String> = change_set
            .risky_items()
            .map(|i| format!("  {} {} ({})", i.action, i.resource_id, i.reasons.join("; ")))
            .collect();
        let message = format!(
            "Stack {} has risky changes (change set {}):\n{}\nApply them?",
            change_set.stack_id(),
            change_set.short_fingerprint(),
            risky.join("\n")
        );

        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(message)
                .default(false)
                .interact()
                .unwrap_or(false)
        });

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(true)) => Ok(ApprovalDecision::Approved),
            Ok(Ok(false)) => Ok(ApprovalDecision::Rejected {
                reason: "declined by operator".into(),
            }),
            Ok(Err(e)) => Err(ReviewError::Gate {
                gate: self.name().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(stack_id = %change_set.stack_id(), "Approval prompt timed out");
                Err(ReviewError::ApprovalTimedOut {
                    stack_id: change_set.stack_id().clone(),
                    fingerprint: change_set.fingerprint().to_string(),
                    waited: timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ApprovalGate for OperatorGate {
    async fn review(&self, change_set: &ChangeSet) -> Result<ApprovalDecision> {
        if self.auto_approve || self.is_preapproved(change_set) {
            return Ok(ApprovalDecision::Approved);
        }
        match self.mode {
            PromptMode::Interactive(timeout) => self.prompt(change_set, timeout).await,
            PromptMode::Never => Ok(ApprovalDecision::Rejected {
                reason: format!(
                    "not approved; rerun with --approve {}",
                    change_set.fingerprint()
                ),
            }),
        }
    }

    fn name(&self) -> &str {
        "operator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_registry::ConsumerSnapshot;
    use keel_review::ChangeSetReviewer;
    use keel_types::{ResourceSpec, StackSpec};
    use serde_json::json;

    fn risky_change_set() -> ChangeSet {
        let stack = |cidr: &str| {
            StackSpec::new("network")
                .with_export("vpc-id", "vpc-1")
                .with_resource(
                    "vpc",
                    ResourceSpec::new("Network::Vpc")
                        .with_property("CidrBlock", json!(cidr))
                        .immutable("CidrBlock")
                        .backing("vpc-id"),
                )
        };
        let consumers = ConsumerSnapshot::default().with_consumer("network", "vpc-id", "app");
        let change_set = ChangeSetReviewer::new().compute(
            Some(&stack("10.0.0.0/16")),
            &stack("10.1.0.0/16"),
            &consumers,
        );
        assert!(change_set.is_risky());
        change_set
    }

    #[tokio::test]
    async fn test_unattended_run_rejects_with_hint() {
        let change_set = risky_change_set();
        let gate = OperatorGate::new(false, Vec::new(), PromptMode::Never);
        match gate.review(&change_set).await.unwrap() {
            ApprovalDecision::Rejected { reason } => {
                assert!(reason.contains(change_set.fingerprint()))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_preapproved_fingerprints() {
        let change_set = risky_change_set();

        let exact = OperatorGate::new(false, vec![change_set.fingerprint().to_string()], PromptMode::Never);
        assert!(exact.review(&change_set).await.unwrap().is_approved());

        let short = OperatorGate::new(
            false,
            vec![change_set.short_fingerprint().to_string()],
            PromptMode::Never,
        );
        assert!(short.review(&change_set).await.unwrap().is_approved());

        let too_short = OperatorGate::new(
            false,
            vec![change_set.fingerprint()[..4].to_string()],
            PromptMode::Never,
        );
        assert!(!too_short.review(&change_set).await.unwrap().is_approved());

        let auto = OperatorGate::new(true, Vec::new(), PromptMode::Never);
        assert!(auto.review(&change_set).await.unwrap().is_approved());
    }
}
