//! The per-user credit ledger
//!
//! Usage in a subscription period is first covered by the subscription
//! allowance. Anything above it is charged to purchased packs, oldest
//! first. Reconciliation compares what the packs should have paid with
//! what they did pay and moves only the difference, so running it again
//! with unchanged usage does nothing.

use crate::config::CreditConfig;
use crate::credits::CreditCalculator;
use crate::error::{Error, Result};
use crate::usage::{CreditPurchase, PurchaseStore, UsageMessage, UsageStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Result of a FIFO deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deduction {
    pub requested: u64,
    pub deducted: u64,
}

impl Deduction {
    /// Credits that could not be covered by any purchase
    pub fn shortfall(&self) -> u64 {
        self.requested - self.deducted
    }
}

/// Result of reconciling purchases against period usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub period_usage: u64,
    /// What purchases should have paid in total
    pub expected_deducted: u64,
    /// What purchases had paid before this run
    pub previously_deducted: u64,
    /// Positive for an extra deduction, negative for a refund
    pub adjusted: i64,
    /// Overage no purchase could cover
    pub shortfall: u64,
}

/// A user's credit position for the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditBalance {
    pub period_usage: u64,
    pub subscription_allowance: u64,
    pub subscription_remaining: u64,
    pub purchased_remaining: u64,
    /// Usage above the allowance
    pub overage: u64,
    pub unrestricted: bool,
}

impl CreditBalance {
    /// Credits still spendable
    pub fn available(&self) -> u64 {
        self.subscription_remaining + self.purchased_remaining
    }

    /// Check if the user may start another request
    pub fn can_send(&self) -> bool {
        self.unrestricted || self.available() > 0
    }
}

/// Sum credits over `(message_id, credits)` pairs, counting each id once.
///
/// The first occurrence of an id wins.
pub fn sum_unique_credits<'a, I>(items: I) -> u64
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|(id, _)| seen.insert(*id))
        .map(|(_, credits)| credits)
        .fold(0, u64::saturating_add)
}

/// Credits used by billable rows since `period_start`
pub fn aggregate_usage(
    calculator: &CreditCalculator,
    rows: &[UsageMessage],
    period_start: DateTime<Utc>,
) -> u64 {
    sum_unique_credits(
        rows.iter()
            .filter(|row| row.is_billable(period_start))
            .map(|row| {
                let credits = calculator.calculate_credits(
                    &row.model,
                    row.input_tokens.unwrap_or(0),
                    row.output_tokens.unwrap_or(0),
                );
                (row.message_id.as_str(), credits)
            }),
    )
}

/// Credits already taken from all purchases
pub fn already_deducted(purchases: &[CreditPurchase]) -> u64 {
    purchases
        .iter()
        .map(CreditPurchase::consumed)
        .fold(0, u64::saturating_add)
}

/// Take `amount` from purchases, oldest first. Returns the amount taken.
pub fn deduct_fifo(purchases: &mut [CreditPurchase], amount: u64) -> u64 {
    let mut order: Vec<usize> = (0..purchases.len()).collect();
    order.sort_by_key(|&i| purchases[i].purchased_at);

    let mut owed = amount;
    for i in order {
        if owed == 0 {
            break;
        }
        let purchase = &mut purchases[i];
        let take = purchase.credits_remaining.min(owed);
        if take == 0 {
            continue;
        }
        purchase.credits_remaining -= take;
        purchase.refresh_status();
        owed -= take;
    }
    amount - owed
}

/// Give back up to `amount`, newest purchase first, never above a
/// purchase's original size. Returns the amount given back.
pub fn refund_lifo(purchases: &mut [CreditPurchase], amount: u64) -> u64 {
    let mut order: Vec<usize> = (0..purchases.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(purchases[i].purchased_at));

    let mut owed = amount;
    for i in order {
        if owed == 0 {
            break;
        }
        let purchase = &mut purchases[i];
        let give = purchase.consumed().min(owed);
        if give == 0 {
            continue;
        }
        purchase.credits_remaining += give;
        purchase.refresh_status();
        owed -= give;
    }
    amount - owed
}

/// Serialized access to each user's purchases
pub struct CreditLedger {
    calculator: CreditCalculator,
    subscription_allowance: u64,
    pack_size: u64,
    unrestricted: bool,
    usage: Arc<dyn UsageStore>,
    purchases: Arc<dyn PurchaseStore>,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CreditLedger {
    /// Create a ledger over the given stores
    pub fn new(
        config: &CreditConfig,
        calculator: CreditCalculator,
        usage: Arc<dyn UsageStore>,
        purchases: Arc<dyn PurchaseStore>,
    ) -> Self {
        Self {
            calculator,
            subscription_allowance: config.subscription_allowance,
            pack_size: config.pack_size,
            unrestricted: config.unrestricted,
            usage,
            purchases,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The calculator used for usage aggregation
    pub fn calculator(&self) -> &CreditCalculator {
        &self.calculator
    }

    /// Credits used in the period starting at `period_start`
    pub async fn period_usage(&self, user_id: &str, period_start: DateTime<Utc>) -> Result<u64> {
        let rows = self.usage.usage_since(user_id, period_start).await?;
        Ok(aggregate_usage(&self.calculator, &rows, period_start))
    }

    /// Take `amount` credits from the user's purchases, oldest first.
    ///
    /// Running out of purchased credits is not an error; the shortfall is
    /// reported in the result.
    pub async fn deduct(&self, user_id: &str, amount: u64) -> Result<Deduction> {
        let _guard = self.lock_user(user_id).await;

        let mut purchases = self.owned_purchases(user_id).await?;
        let deducted = deduct_fifo(&mut purchases, amount);
        if deducted > 0 {
            self.purchases.update(user_id, &purchases).await?;
        }

        let result = Deduction {
            requested: amount,
            deducted,
        };
        if result.shortfall() > 0 {
            tracing::warn!(
                "Credit shortfall for user {}: {} of {} credits uncovered",
                user_id,
                result.shortfall(),
                amount
            );
        }
        Ok(result)
    }

    /// Bring purchase balances in line with the period's actual usage
    pub async fn reconcile(&self, user_id: &str, period_start: DateTime<Utc>) -> Result<Reconciliation> {
        let _guard = self.lock_user(user_id).await;

        let period_usage = self.period_usage(user_id, period_start).await?;
        let expected_deducted = period_usage.saturating_sub(self.subscription_allowance);

        let mut purchases = self.owned_purchases(user_id).await?;
        let previously_deducted = already_deducted(&purchases);

        let adjusted = if expected_deducted > previously_deducted {
            let taken = deduct_fifo(&mut purchases, expected_deducted - previously_deducted);
            i64::try_from(taken).unwrap_or(i64::MAX)
        } else if expected_deducted < previously_deducted {
            let refunded = refund_lifo(&mut purchases, previously_deducted - expected_deducted);
            -i64::try_from(refunded).unwrap_or(i64::MAX)
        } else {
            0
        };

        if adjusted != 0 {
            self.purchases.update(user_id, &purchases).await?;
            tracing::debug!(
                "Reconciled user {}: usage={} expected={} previous={} adjusted={}",
                user_id,
                period_usage,
                expected_deducted,
                previously_deducted,
                adjusted
            );
        }

        let shortfall = expected_deducted.saturating_sub(already_deducted(&purchases));
        if shortfall > 0 {
            tracing::warn!(
                "Credit shortfall for user {}: {} credits of overage uncovered",
                user_id,
                shortfall
            );
        }

        Ok(Reconciliation {
            period_usage,
            expected_deducted,
            previously_deducted,
            adjusted,
            shortfall,
        })
    }

    /// Record a newly bought pack of the configured size
    pub async fn purchase_pack(&self, user_id: &str, purchased_at: DateTime<Utc>) -> Result<CreditPurchase> {
        let _guard = self.lock_user(user_id).await;
        let purchase = CreditPurchase::new(user_id, self.pack_size, purchased_at);
        self.purchases.insert(purchase.clone()).await?;
        tracing::debug!("User {} bought {} credits ({})", user_id, self.pack_size, purchase.id);
        Ok(purchase)
    }

    /// The user's credit position for the period
    pub async fn balance(&self, user_id: &str, period_start: DateTime<Utc>) -> Result<CreditBalance> {
        let period_usage = self.period_usage(user_id, period_start).await?;
        let purchases = self.owned_purchases(user_id).await?;
        Ok(CreditBalance {
            period_usage,
            subscription_allowance: self.subscription_allowance,
            subscription_remaining: self.subscription_allowance.saturating_sub(period_usage),
            purchased_remaining: purchases
                .iter()
                .map(|p| p.credits_remaining)
                .fold(0, u64::saturating_add),
            overage: period_usage.saturating_sub(self.subscription_allowance),
            unrestricted: self.unrestricted,
        })
    }

    async fn owned_purchases(&self, user_id: &str) -> Result<Vec<CreditPurchase>> {
        let purchases = self.purchases.purchases(user_id).await?;
        if let Some(foreign) = purchases.iter().find(|p| p.user_id != user_id) {
            return Err(Error::unauthorized(user_id, format!("purchase {}", foreign.id)));
        }
        Ok(purchases)
    }

    async fn lock_user(&self, user_id: &str) -> UserGuard<'_> {
        let lock = {
            let mut locks = self.user_locks.lock();
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };
        let guard = lock.clone().lock_owned().await;
        UserGuard {
            locks: &self.user_locks,
            user_id: user_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of users with a live lock entry
    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.user_locks.lock().len()
    }
}

/// Holds a user's ledger lock and drops the map entry once nobody else wants it
struct UserGuard<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    user_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's own reference is gone
        self.guard.take();
        let mut locks = self.locks.lock();
        // Map entry plus `self.lock`: no other holder or waiter remains
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user_id);
        }
    }
}
