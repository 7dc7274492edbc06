// PostgreSQL-backed collaborator adapters
//
// Idempotency is enforced by unique keys plus INSERT .. ON CONFLICT DO
// NOTHING; a conflicting insert falls back to reading the existing row, so
// repeat calls observe the first call's outcome.

use crate::collaborators::{
    JournalLine, JournalPost, LedgerPoster, PaymentFeed, PolicyIssue, PolicyIssuer,
};
use crate::db::DbPool;
use crate::errors::CollaboratorError;
use crate::models::PaymentEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

/// Journal postings written to the shared database.
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerPoster for PgLedger {
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    async fn post_journal_entry(
        &self,
        source_ref: &str,
        lines: &[JournalLine],
    ) -> Result<JournalPost, CollaboratorError> {
        if lines.is_empty() {
            return Err(CollaboratorError::rejected(
                "ledger",
                "journal entry has no lines",
            ));
        }
        let debits: i64 = lines.iter().filter(|l| l.is_debit).map(|l| l.amount_minor).sum();
        let credits: i64 = lines.iter().filter(|l| !l.is_debit).map(|l| l.amount_minor).sum();
        if debits != credits {
            return Err(CollaboratorError::rejected(
                "ledger",
                format!("unbalanced journal entry: debits {} credits {}", debits, credits),
            ));
        }

        let entry_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO journal_entries (id, source_ref, created_at)
            VALUES ($1, $2, now())
            ON CONFLICT (source_ref) DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(source_ref)
        .execute(&mut *tx)
        .await
        .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback()
                .await
                .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;
            let row = sqlx::query("SELECT id FROM journal_entries WHERE source_ref = $1")
                .bind(source_ref)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;
            let existing_id: Uuid = row
                .try_get("id")
                .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;
            tracing::debug!(source_ref, entry_id = %existing_id, "Journal entry already posted");
            return Ok(JournalPost {
                entry_id: existing_id,
                newly_posted: false,
            });
        }

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO journal_lines (id, entry_id, account_code, amount_minor, is_debit)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entry_id)
            .bind(&line.account_code)
            .bind(line.amount_minor)
            .bind(line.is_debit)
            .execute(&mut *tx)
            .await
            .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| CollaboratorError::unavailable("ledger", e.to_string()))?;

        tracing::info!(source_ref, entry_id = %entry_id, "Journal entry posted");
        Ok(JournalPost {
            entry_id,
            newly_posted: true,
        })
    }
}

/// Policy issuance written to the shared database.
pub struct PgPolicyAdmin {
    pool: DbPool,
}

impl PgPolicyAdmin {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyIssuer for PgPolicyAdmin {
    #[instrument(skip(self))]
    async fn issue_policy(
        &self,
        rider_id: &str,
        window_id: &str,
    ) -> Result<PolicyIssue, CollaboratorError> {
        let policy_id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO policies (id, rider_id, window_id, issued_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (rider_id, window_id) DO NOTHING
            "#,
        )
        .bind(policy_id)
        .bind(rider_id)
        .bind(window_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| CollaboratorError::unavailable("policy-admin", e.to_string()))?
        .rows_affected()
            > 0;

        if inserted {
            tracing::info!(rider_id, window_id, policy_id = %policy_id, "Policy issued");
            return Ok(PolicyIssue {
                policy_id,
                newly_issued: true,
            });
        }

        let row = sqlx::query("SELECT id FROM policies WHERE rider_id = $1 AND window_id = $2")
            .bind(rider_id)
            .bind(window_id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| CollaboratorError::unavailable("policy-admin", e.to_string()))?;
        let existing_id: Uuid = row
            .try_get("id")
            .map_err(|e| CollaboratorError::unavailable("policy-admin", e.to_string()))?;
        tracing::debug!(rider_id, window_id, policy_id = %existing_id, "Policy already issued");
        Ok(PolicyIssue {
            policy_id: existing_id,
            newly_issued: false,
        })
    }
}

/// Confirmed payments read from the shared database.
pub struct PgPaymentFeed {
    pool: DbPool,
}

impl PgPaymentFeed {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentFeed for PgPaymentFeed {
    #[instrument(skip(self))]
    async fn confirmed_in(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<PaymentEvent>, CollaboratorError> {
        let rows = sqlx::query(
            r#"
            SELECT rider_id, amount_minor, confirmed_at, reference
            FROM payments
            WHERE confirmed_at >= $1 AND confirmed_at < $2
            ORDER BY confirmed_at, reference
            "#,
        )
        .bind(range_start)
        .bind(range_end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(PaymentEvent {
                rider_id: row
                    .try_get("rider_id")
                    .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?,
                amount_minor: row
                    .try_get("amount_minor")
                    .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?,
                confirmed_at: row
                    .try_get("confirmed_at")
                    .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?,
                reference: row
                    .try_get("reference")
                    .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?,
            });
        }
        tracing::debug!(count = events.len(), "Collected confirmed payments");
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn cycle_total(
        &self,
        rider_id: &str,
        cycle_start: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, CollaboratorError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0)::BIGINT AS total
            FROM payments
            WHERE rider_id = $1 AND confirmed_at >= $2 AND confirmed_at < $3
            "#,
        )
        .bind(rider_id)
        .bind(cycle_start)
        .bind(until)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))?;

        row.try_get("total")
            .map_err(|e| CollaboratorError::unavailable("payment-feed", e.to_string()))
    }
}
