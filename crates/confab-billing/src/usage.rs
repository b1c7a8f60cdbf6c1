//! Billing records and the stores that hold them

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use confab_core::Role;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The billing view of one persisted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMessage {
    /// Caller-chosen, unique within its conversation
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Copied into a forked conversation; never billed again
    pub was_forked: bool,
    /// Paid for with the user's own provider key; never billed
    pub used_own_key: bool,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl UsageMessage {
    /// Check whether this row counts toward period usage
    pub fn is_billable(&self, period_start: DateTime<Utc>) -> bool {
        self.role == Role::User
            && self.created_at >= period_start
            && self.input_tokens.is_some()
            && !self.was_forked
            && !self.used_own_key
    }
}

/// Whether a purchased pack still has credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Active,
    Depleted,
}

/// One purchased credit pack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPurchase {
    pub id: String,
    pub user_id: String,
    pub purchased_at: DateTime<Utc>,
    pub credits_amount: u64,
    pub credits_remaining: u64,
    pub status: PurchaseStatus,
}

impl CreditPurchase {
    /// A fresh, untouched pack
    pub fn new(user_id: impl Into<String>, credits_amount: u64, purchased_at: DateTime<Utc>) -> Self {
        let mut purchase = Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            purchased_at,
            credits_amount,
            credits_remaining: credits_amount,
            status: PurchaseStatus::Active,
        };
        purchase.refresh_status();
        purchase
    }

    /// Credits already taken from this pack
    pub fn consumed(&self) -> u64 {
        self.credits_amount.saturating_sub(self.credits_remaining)
    }

    /// Recompute `status` from `credits_remaining`
    pub fn refresh_status(&mut self) {
        self.status = if self.credits_remaining == 0 {
            PurchaseStatus::Depleted
        } else {
            PurchaseStatus::Active
        };
    }
}

/// Source of usage rows for period aggregation
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// All of a user's message rows created at or after `since`
    async fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<UsageMessage>>;
}

/// Persistence for purchased credit packs
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// All of a user's purchases, in any order
    async fn purchases(&self, user_id: &str) -> Result<Vec<CreditPurchase>>;

    /// Record a new purchase
    async fn insert(&self, purchase: CreditPurchase) -> Result<()>;

    /// Write back balances. Every row must already exist and belong to `user_id`.
    async fn update(&self, user_id: &str, purchases: &[CreditPurchase]) -> Result<()>;
}

/// Usage rows held in memory
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    rows: RwLock<Vec<UsageMessage>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row as-is, duplicates included
    pub fn push(&self, row: UsageMessage) {
        self.rows.write().push(row);
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<UsageMessage>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| row.user_id == user_id && row.created_at >= since)
            .cloned()
            .collect())
    }
}

/// Purchases held in memory
#[derive(Debug, Default)]
pub struct InMemoryPurchaseStore {
    rows: RwLock<Vec<CreditPurchase>>,
}

impl InMemoryPurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PurchaseStore for InMemoryPurchaseStore {
    async fn purchases(&self, user_id: &str) -> Result<Vec<CreditPurchase>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, purchase: CreditPurchase) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.iter().any(|p| p.id == purchase.id) {
            return Err(Error::Store(format!("duplicate purchase id {}", purchase.id)));
        }
        rows.push(purchase);
        Ok(())
    }

    async fn update(&self, user_id: &str, purchases: &[CreditPurchase]) -> Result<()> {
        let mut rows = self.rows.write();

        // Validate everything before writing anything
        let mut targets = Vec::with_capacity(purchases.len());
        for update in purchases {
            let index = rows
                .iter()
                .position(|p| p.id == update.id)
                .ok_or_else(|| Error::NotFound(format!("purchase {}", update.id)))?;
            if rows[index].user_id != user_id || update.user_id != user_id {
                return Err(Error::unauthorized(user_id, format!("purchase {}", update.id)));
            }
            targets.push(index);
        }

        for (index, update) in targets.into_iter().zip(purchases) {
            let row = &mut rows[index];
            row.credits_remaining = update.credits_remaining.min(row.credits_amount);
            row.refresh_status();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    fn usage(id: &str, role: Role, day: u32) -> UsageMessage {
        UsageMessage {
            message_id: id.to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            role,
            created_at: at(day),
            model: "openai:gpt-4o".to_string(),
            input_tokens: Some(100),
            output_tokens: Some(10),
            was_forked: false,
            used_own_key: false,
            discarded_at: None,
        }
    }

    #[test]
    fn test_billable_filters() {
        let start = at(10);
        assert!(usage("m", Role::User, 10).is_billable(start));
        assert!(!usage("m", Role::User, 9).is_billable(start));
        assert!(!usage("m", Role::Assistant, 11).is_billable(start));

        let mut no_tokens = usage("m", Role::User, 11);
        no_tokens.input_tokens = None;
        assert!(!no_tokens.is_billable(start));

        let mut forked = usage("m", Role::User, 11);
        forked.was_forked = true;
        assert!(!forked.is_billable(start));

        let mut own_key = usage("m", Role::User, 11);
        own_key.used_own_key = true;
        assert!(!own_key.is_billable(start));

        let mut discarded = usage("m", Role::User, 11);
        discarded.discarded_at = Some(at(12));
        assert!(discarded.is_billable(start));
    }

    #[test]
    fn test_purchase_status_follows_remaining() {
        let mut purchase = CreditPurchase::new("u1", 100, at(1));
        assert_eq!(purchase.status, PurchaseStatus::Active);
        purchase.credits_remaining = 0;
        purchase.refresh_status();
        assert_eq!(purchase.status, PurchaseStatus::Depleted);
        assert_eq!(purchase.consumed(), 100);
        assert_eq!(CreditPurchase::new("u1", 0, at(1)).status, PurchaseStatus::Depleted);
    }

    #[tokio::test]
    async fn test_usage_store_filters_user_and_period() {
        let store = InMemoryUsageStore::new();
        store.push(usage("a", Role::User, 5));
        store.push(usage("b", Role::User, 15));
        let mut other = usage("c", Role::User, 15);
        other.user_id = "u2".into();
        store.push(other);

        let rows = store.usage_since("u1", at(10)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id, "b");
    }

    #[tokio::test]
    async fn test_purchase_update_rejects_foreign_rows() {
        let store = InMemoryPurchaseStore::new();
        let mine = CreditPurchase::new("u1", 100, at(1));
        let theirs = CreditPurchase::new("u2", 100, at(1));
        store.insert(mine.clone()).await.unwrap();
        store.insert(theirs.clone()).await.unwrap();

        let mut drained = theirs.clone();
        drained.credits_remaining = 0;
        let err = store.update("u1", &[drained]).await.unwrap_err();
        assert!(err.is_authorization());

        let untouched = store.purchases("u2").await.unwrap();
        assert_eq!(untouched[0].credits_remaining, 100);
    }

    #[tokio::test]
    async fn test_purchase_update_missing_row() {
        let store = InMemoryPurchaseStore::new();
        let ghost = CreditPurchase::new("u1", 100, at(1));
        let err = store.update("u1", &[ghost]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_purchase_update_writes_balance_and_status() {
        let store = InMemoryPurchaseStore::new();
        let mut purchase = CreditPurchase::new("u1", 100, at(1));
        store.insert(purchase.clone()).await.unwrap();

        purchase.credits_remaining = 0;
        store.update("u1", &[purchase]).await.unwrap();
        let rows = store.purchases("u1").await.unwrap();
        assert_eq!(rows[0].credits_remaining, 0);
        assert_eq!(rows[0].status, PurchaseStatus::Depleted);
    }
}
