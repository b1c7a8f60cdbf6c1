//! confab-billing: Token pricing and credit accounting
//!
//! Converts token counts into integer credits and keeps the per-user ledger
//! of subscription allowance and purchased credit packs.

pub mod config;
pub mod credits;
pub mod error;
pub mod ledger;
pub mod pricing;
pub mod usage;

pub use config::CreditConfig;
pub use credits::{CreditCalculator, Quote};
pub use error::{Error, Result};
pub use ledger::{CreditBalance, CreditLedger, Deduction, Reconciliation};
pub use pricing::{ModelPrice, PricingTable};
pub use usage::{
    CreditPurchase, InMemoryPurchaseStore, InMemoryUsageStore, PurchaseStatus, PurchaseStore,
    UsageMessage, UsageStore,
};
