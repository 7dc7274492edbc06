// In-memory collaborator adapters
//
// Mirror the idempotency contracts of the PostgreSQL adapters and add
// failure injection, so batch behavior under collaborator outages can be
// exercised without a database.

use crate::collaborators::{
    JournalLine, JournalPost, LedgerPoster, PaymentFeed, PolicyIssue, PolicyIssuer,
};
use crate::errors::CollaboratorError;
use crate::models::PaymentEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<String, (Uuid, Vec<JournalLine>)>>,
    unavailable: Mutex<bool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    pub fn entry_count(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn lines_for(&self, source_ref: &str) -> Option<Vec<JournalLine>> {
        lock(&self.entries)
            .get(source_ref)
            .map(|(_, lines)| lines.clone())
    }
}

#[async_trait]
impl LedgerPoster for InMemoryLedger {
    async fn post_journal_entry(
        &self,
        source_ref: &str,
        lines: &[JournalLine],
    ) -> Result<JournalPost, CollaboratorError> {
        if *lock(&self.unavailable) {
            return Err(CollaboratorError::unavailable("ledger", "injected outage"));
        }
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

        let mut entries = lock(&self.entries);
        if let Some((entry_id, _)) = entries.get(source_ref) {
            return Ok(JournalPost {
                entry_id: *entry_id,
                newly_posted: false,
            });
        }
        let entry_id = Uuid::new_v4();
        entries.insert(source_ref.to_string(), (entry_id, lines.to_vec()));
        Ok(JournalPost {
            entry_id,
            newly_posted: true,
        })
    }
}

#[derive(Default)]
pub struct InMemoryPolicyAdmin {
    policies: Mutex<HashMap<(String, String), Uuid>>,
    failing_riders: Mutex<HashSet<String>>,
}

impl InMemoryPolicyAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issuance for this rider fails with a transient error until cleared.
    pub fn fail_rider(&self, rider_id: impl Into<String>) {
        lock(&self.failing_riders).insert(rider_id.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_riders).clear();
    }

    pub fn policy_count(&self) -> usize {
        lock(&self.policies).len()
    }

    pub fn has_cover(&self, rider_id: &str, window_id: &str) -> bool {
        lock(&self.policies).contains_key(&(rider_id.to_string(), window_id.to_string()))
    }
}

#[async_trait]
impl PolicyIssuer for InMemoryPolicyAdmin {
    async fn issue_policy(
        &self,
        rider_id: &str,
        window_id: &str,
    ) -> Result<PolicyIssue, CollaboratorError> {
        if lock(&self.failing_riders).contains(rider_id) {
            return Err(CollaboratorError::unavailable(
                "policy-admin",
                format!("injected outage for rider {}", rider_id),
            ));
        }
        let mut policies = lock(&self.policies);
        let key = (rider_id.to_string(), window_id.to_string());
        if let Some(policy_id) = policies.get(&key) {
            return Ok(PolicyIssue {
                policy_id: *policy_id,
                newly_issued: false,
            });
        }
        let policy_id = Uuid::new_v4();
        policies.insert(key, policy_id);
        Ok(PolicyIssue {
            policy_id,
            newly_issued: true,
        })
    }
}

#[derive(Default)]
pub struct InMemoryPaymentFeed {
    payments: Mutex<Vec<PaymentEvent>>,
}

impl InMemoryPaymentFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, payment: PaymentEvent) {
        lock(&self.payments).push(payment);
    }
}

#[async_trait]
impl PaymentFeed for InMemoryPaymentFeed {
    async fn confirmed_in(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<PaymentEvent>, CollaboratorError> {
        let mut events: Vec<PaymentEvent> = lock(&self.payments)
            .iter()
            .filter(|p| p.confirmed_at >= range_start && p.confirmed_at < range_end)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.confirmed_at
                .cmp(&b.confirmed_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        Ok(events)
    }

    async fn cycle_total(
        &self,
        rider_id: &str,
        cycle_start: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, CollaboratorError> {
        Ok(lock(&self.payments)
            .iter()
            .filter(|p| {
                p.rider_id == rider_id && p.confirmed_at >= cycle_start && p.confirmed_at < until
            })
            .map(|p| p.amount_minor)
            .sum())
    }
}
