//! Token counts to credits

use crate::config::{CreditConfig, DEFAULT_MARKUP, MAX_MARKUP, MIN_MARKUP};
use crate::pricing::PricingTable;

/// Markup is carried as parts-per-million so all charge math stays integral
const MARKUP_SCALE: u128 = 1_000_000;
/// Prices are per million tokens
const TOKENS_PER_PRICE_UNIT: u128 = 1_000_000;

/// Result of pricing one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub credits: u64,
    /// The model was not in the table and was charged the default price
    pub used_default_price: bool,
}

impl Quote {
    const FREE: Quote = Quote {
        credits: 0,
        used_default_price: false,
    };
}

/// Converts token counts into integer credit charges
#[derive(Debug, Clone)]
pub struct CreditCalculator {
    table: PricingTable,
    markup_ppm: u128,
    unrestricted: bool,
}

impl CreditCalculator {
    /// Create a calculator over `table` using the markup and mode from `config`
    pub fn new(table: PricingTable, config: &CreditConfig) -> Self {
        Self {
            table,
            markup_ppm: markup_ppm(config.markup),
            unrestricted: config.unrestricted,
        }
    }

    /// Calculator over the built-in pricing table
    pub fn from_config(config: &CreditConfig) -> Self {
        Self::new(PricingTable::builtin(), config)
    }

    /// The pricing table in use
    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    /// Credits owed for a request. Always rounds up.
    pub fn calculate_credits(&self, model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
        self.quote(model, input_tokens, output_tokens).credits
    }

    /// Credits owed for a request, noting whether the fallback price applied
    pub fn quote(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Quote {
        if self.unrestricted {
            return Quote::FREE;
        }
        if input_tokens == 0 && output_tokens == 0 {
            return Quote::FREE;
        }

        let (price, used_default_price) = match self.table.get(model) {
            Some(price) => (price, false),
            None => {
                tracing::warn!(
                    "No pricing for model {}, charging the default rate",
                    model
                );
                (self.table.default_price(), true)
            }
        };

        let micro = (input_tokens as u128)
            .saturating_mul(price.input as u128)
            .saturating_add((output_tokens as u128).saturating_mul(price.output as u128));
        let scaled = micro.saturating_mul(self.markup_ppm);
        let credits = scaled.div_ceil(TOKENS_PER_PRICE_UNIT * MARKUP_SCALE);

        Quote {
            credits: u64::try_from(credits).unwrap_or(u64::MAX),
            used_default_price,
        }
    }
}

/// Markup in parts-per-million, rounded up so the charge never drops below cost
fn markup_ppm(markup: f64) -> u128 {
    let markup = if markup.is_finite() {
        markup.clamp(MIN_MARKUP, MAX_MARKUP)
    } else {
        DEFAULT_MARKUP
    };
    ((markup * MARKUP_SCALE as f64).ceil() as u128).max(1)
}

impl Default for CreditCalculator {
    fn default() -> Self {
        Self::from_config(&CreditConfig::default())
    }
}
