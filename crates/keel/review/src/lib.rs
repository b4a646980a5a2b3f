//! Keel Review - Change sets and approval gates
//!
//! Before a stack is applied its desired declaration is diffed against the
//! last deployed one. Every resource-level difference becomes a classified
//! [`ChangeItem`]; items that replace or remove a resource whose exports
//! other stacks still consume carry a risk flag and need approval.
//!
//! Computing a change set is pure and deterministic. Approval is an
//! external signal, modelled by the [`ApprovalGate`] trait.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod approval;
pub mod changeset;
pub mod error;
pub mod reviewer;

pub use approval::{ApprovalBoard, ApprovalDecision, ApprovalGate, AutoApprove, RejectRisky};
pub use changeset::{AttributeChange, ChangeAction, ChangeItem, ChangeSet};
pub use error::{Result, ReviewError};
pub use reviewer::ChangeSetReviewer;
