//! Per-model token prices
//!
//! Prices are whole credits per million tokens. One credit is a tenth of a
//! US cent, so a model listed at $3.00 / 1M input tokens costs 3000 here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Price per 1M tokens, in credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: u64,
    pub output: u64,
}

impl ModelPrice {
    /// Create a new price
    pub const fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }
}

/// Charged for models missing from the table. Matches the most expensive
/// entry so an unlisted model is never undercharged.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice::new(15_000, 75_000);

struct PriceEntry {
    id: &'static str,
    input: u64,
    output: u64,
}

const PRICE_ENTRIES: &[PriceEntry] = &[
    PriceEntry { id: "anthropic:claude-opus-4", input: 15_000, output: 75_000 },
    PriceEntry { id: "anthropic:claude-sonnet-4", input: 3_000, output: 15_000 },
    PriceEntry { id: "anthropic:claude-3-5-haiku", input: 800, output: 4_000 },
    PriceEntry { id: "openai:gpt-5", input: 1_250, output: 10_000 },
    PriceEntry { id: "openai:gpt-4.1", input: 2_000, output: 8_000 },
    PriceEntry { id: "openai:gpt-4.1-mini", input: 400, output: 1_600 },
    PriceEntry { id: "openai:gpt-4.1-nano", input: 100, output: 400 },
    PriceEntry { id: "openai:gpt-4o", input: 2_500, output: 10_000 },
    PriceEntry { id: "openai:gpt-4o-mini", input: 150, output: 600 },
    PriceEntry { id: "openai:o4-mini", input: 1_100, output: 4_400 },
    PriceEntry { id: "google:gemini-2.5-pro", input: 1_250, output: 10_000 },
    PriceEntry { id: "google:gemini-2.5-flash", input: 300, output: 2_500 },
    PriceEntry { id: "google:gemini-2.5-flash-lite", input: 75, output: 300 },
    PriceEntry { id: "google:gemini-2.0-flash", input: 100, output: 400 },
    PriceEntry { id: "xai:grok-4", input: 3_000, output: 15_000 },
    PriceEntry { id: "deepseek:deepseek-chat", input: 270, output: 1_100 },
];

/// Lookup table from model identifier to price
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    default_price: ModelPrice,
}

impl PricingTable {
    /// Create an empty table with the given fallback price
    pub fn empty(default_price: ModelPrice) -> Self {
        Self {
            prices: HashMap::new(),
            default_price,
        }
    }

    /// The built-in table
    pub fn builtin() -> Self {
        let mut table = Self::empty(DEFAULT_PRICE);
        for entry in PRICE_ENTRIES {
            table.insert(entry.id, ModelPrice::new(entry.input, entry.output));
        }
        table
    }

    /// Add or replace a model price
    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    /// Look up a model's price
    pub fn get(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }

    /// Price charged for unknown models
    pub fn default_price(&self) -> ModelPrice {
        self.default_price
    }

    /// All entries, sorted by model id
    pub fn entries(&self) -> Vec<(&str, ModelPrice)> {
        let mut entries: Vec<_> = self
            .prices
            .iter()
            .map(|(id, price)| (id.as_str(), *price))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Number of priced models
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Check if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}
