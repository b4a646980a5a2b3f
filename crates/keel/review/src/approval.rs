//! Approval gates
//!
//! A stack whose change set carries a risky item waits on its gate before
//! it may apply. Gates decide per change set fingerprint.

use crate::changeset::ChangeSet;
use crate::error::{Result, ReviewError};
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::StackId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Outcome of a review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// Governance hook consulted before a risky change set is applied
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Decide on a change set. May wait for an external signal.
    async fn review(&self, change_set: &ChangeSet) -> Result<ApprovalDecision>;

    /// Gate name for logging
    fn name(&self) -> &str;
}

/// Gate that approves everything
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn review(&self, _change_set: &ChangeSet) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approved)
    }

    fn name(&self) -> &str {
        "auto-approve"
    }
}

/// Gate that rejects any change set with a risky item
pub struct RejectRisky;

#[async_trait]
impl ApprovalGate for RejectRisky {
    async fn review(&self, change_set: &ChangeSet) -> Result<ApprovalDecision> {
        let risky: Vec<String> = change_set
            .risky_items()
            .map(|i| format!("{} {}", i.action, i.resource_id))
            .collect();
        if risky.is_empty() {
            Ok(ApprovalDecision::Approved)
        } else {
            Ok(ApprovalDecision::Rejected {
                reason: format!("risky changes need approval: {}", risky.join(", ")),
            })
        }
    }

    fn name(&self) -> &str {
        "reject-risky"
    }
}

/// Gate driven by external approve / reject signals
///
/// Fingerprints may be approved ahead of time; otherwise `review` waits
/// until a decision for the change set's fingerprint arrives or the timeout
/// elapses.
pub struct ApprovalBoard {
    decisions: DashMap<String, ApprovalDecision>,
    pending: DashMap<String, StackId>,
    notify: Notify,
    timeout: Duration,
}

impl ApprovalBoard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            decisions: DashMap::new(),
            pending: DashMap::new(),
            notify: Notify::new(),
            timeout,
        }
    }

    /// Board with a set of fingerprints already approved.
    pub fn with_approved<I, S>(timeout: Duration, fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let board = Self::new(timeout);
        for fingerprint in fingerprints {
            board.approve(fingerprint);
        }
        board
    }

    pub fn approve(&self, fingerprint: impl Into<String>) {
        self.decide(fingerprint.into(), ApprovalDecision::Approved);
    }

    pub fn reject(&self, fingerprint: impl Into<String>, reason: impl Into<String>) {
        self.decide(
            fingerprint.into(),
            ApprovalDecision::Rejected {
                reason: reason.into(),
            },
        );
    }

    /// Fingerprints currently waited on.
    pub fn pending(&self) -> BTreeSet<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    fn decide(&self, fingerprint: String, decision: ApprovalDecision) {
        info!(fingerprint = %fingerprint, approved = decision.is_approved(), "Approval decision recorded");
        self.decisions.insert(fingerprint, decision);
        self.notify.notify_waiters();
    }

    /// A decision for `fingerprint`, accepting a unique prefix of at least
    /// twelve characters as shorthand.
    fn lookup(&self, fingerprint: &str) -> Option<ApprovalDecision> {
        if let Some(decision) = self.decisions.get(fingerprint) {
            return Some(decision.clone());
        }
        let matches: Vec<ApprovalDecision> = self
            .decisions
            .iter()
            .filter(|e| e.key().len() >= 12 && fingerprint.starts_with(e.key().as_str()))
            .map(|e| e.value().clone())
            .collect();
        match matches.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl ApprovalGate for ApprovalBoard {
    async fn review(&self, change_set: &ChangeSet) -> Result<ApprovalDecision> {
        let fingerprint = change_set.fingerprint().to_string();
        let deadline = tokio::time::Instant::now() + self.timeout;
        self.pending
            .insert(fingerprint.clone(), change_set.stack_id().clone());

        let outcome = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(decision) = self.lookup(&fingerprint) {
                break Ok(decision);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    stack_id = %change_set.stack_id(),
                    fingerprint = %change_set.short_fingerprint(),
                    "Approval timed out"
                );
                break Err(ReviewError::ApprovalTimedOut {
                    stack_id: change_set.stack_id().clone(),
                    fingerprint: fingerprint.clone(),
                    waited: self.timeout,
                });
            }
        };

        self.pending.remove(&fingerprint);
        outcome
    }

    fn name(&self) -> &str {
        "approval-board"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeAction, ChangeItem};
    use keel_types::ResourceId;
    use std::sync::Arc;

    fn risky_set() -> ChangeSet {
        ChangeSet::new(
            StackId::new("network"),
            vec![ChangeItem {
                resource_id: ResourceId::new("subnets"),
                resource_type: "Network::SubnetSet".into(),
                action: ChangeAction::Replace,
                risky: true,
                changes: Vec::new(),
                reasons: vec!["backs export 'subnets' imported by app".into()],
            }],
        )
    }

    #[tokio::test]
    async fn test_reject_risky() {
        let decision = RejectRisky.review(&risky_set()).await.unwrap();
        assert!(matches!(decision, ApprovalDecision::Rejected { ref reason } if reason.contains("Replace subnets")));
    }

    #[tokio::test]
    async fn test_pre_approved_fingerprint() {
        let set = risky_set();
        let board = ApprovalBoard::with_approved(Duration::from_secs(1), [set.fingerprint()]);
        assert_eq!(board.review(&set).await.unwrap(), ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn test_short_fingerprint_prefix_approves() {
        let set = risky_set();
        let board = ApprovalBoard::with_approved(Duration::from_secs(1), [set.short_fingerprint()]);
        assert!(board.review(&set).await.unwrap().is_approved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_external_signal() {
        let set = risky_set();
        let board = Arc::new(ApprovalBoard::new(Duration::from_secs(600)));

        let waiter = {
            let board = board.clone();
            let set = set.clone();
            tokio::spawn(async move { board.review(&set).await })
        };

        while board.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        board.reject(set.fingerprint(), "change window closed");

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(
            decision,
            ApprovalDecision::Rejected {
                reason: "change window closed".into()
            }
        );
        assert!(board.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_decision() {
        let board = ApprovalBoard::new(Duration::from_secs(30));
        let err = board.review(&risky_set()).await.unwrap_err();
        assert!(matches!(err, ReviewError::ApprovalTimedOut { waited, .. } if waited == Duration::from_secs(30)));
    }
}
