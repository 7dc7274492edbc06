// Collaborator seams for batch settlement
//
// The ledger, policy administration and the payment feed are separate
// systems; only their call shapes are fixed here. Every mutating call is
// idempotent on a caller-supplied key, so a retried or manually re-run
// batch can repeat calls without duplicating their effect.

pub mod memory;
pub mod postgres;

pub use crate::errors::CollaboratorError;
use crate::models::PaymentEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One side of a journal entry (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account_code: String,
    /// Positive amount in smallest currency unit (cents of KES).
    pub amount_minor: i64,
    /// true = debit, false = credit.
    pub is_debit: bool,
}

impl JournalLine {
    pub fn debit(account_code: impl Into<String>, amount_minor: i64) -> Self {
        Self {
            account_code: account_code.into(),
            amount_minor,
            is_debit: true,
        }
    }

    pub fn credit(account_code: impl Into<String>, amount_minor: i64) -> Self {
        Self {
            account_code: account_code.into(),
            amount_minor,
            is_debit: false,
        }
    }
}

/// Result of posting a journal entry. `newly_posted` is false when the
/// source_ref had already been posted and the call was a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPost {
    pub entry_id: Uuid,
    pub newly_posted: bool,
}

/// Result of issuing a policy. `newly_issued` is false when cover for the
/// (rider, window) pair already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyIssue {
    pub policy_id: Uuid,
    pub newly_issued: bool,
}

/// Double-entry ledger. Posting is idempotent by `source_ref`.
#[async_trait]
pub trait LedgerPoster: Send + Sync {
    async fn post_journal_entry(
        &self,
        source_ref: &str,
        lines: &[JournalLine],
    ) -> Result<JournalPost, CollaboratorError>;
}

/// Policy administration. Issuance is idempotent by (rider_id, window_id).
#[async_trait]
pub trait PolicyIssuer: Send + Sync {
    async fn issue_policy(
        &self,
        rider_id: &str,
        window_id: &str,
    ) -> Result<PolicyIssue, CollaboratorError>;
}

/// Read side of the payment stream.
#[async_trait]
pub trait PaymentFeed: Send + Sync {
    /// Confirmed payments with `range_start <= confirmed_at < range_end`,
    /// ordered by confirmation time. Re-querying the same range yields the
    /// same set; confirmations arriving after a window closes are
    /// late-arrivals belonging to a later window.
    async fn confirmed_in(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<PaymentEvent>, CollaboratorError>;

    /// Total confirmed amount for one rider from `cycle_start` (inclusive)
    /// up to `until` (exclusive), in minor units.
    async fn cycle_total(
        &self,
        rider_id: &str,
        cycle_start: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, CollaboratorError>;
}
