//! Credit configuration from environment-style inputs

/// Markup multiplier applied on top of model prices
pub const MARKUP_VAR: &str = "CONFAB_CREDIT_MARKUP";
/// Credits included in each subscription period
pub const SUBSCRIPTION_CREDITS_VAR: &str = "CONFAB_SUBSCRIPTION_CREDITS";
/// Credits granted by one purchased pack
pub const PACK_SIZE_VAR: &str = "CONFAB_CREDIT_PACK_SIZE";
/// Self-hosted switch that makes every request free
pub const UNRESTRICTED_VAR: &str = "CONFAB_UNRESTRICTED";

pub const DEFAULT_MARKUP: f64 = 1.0;
/// Smallest accepted markup, one part per million
pub const MIN_MARKUP: f64 = 0.000_001;
/// Largest accepted markup
pub const MAX_MARKUP: f64 = 1_000.0;
pub const DEFAULT_SUBSCRIPTION_CREDITS: u64 = 10_000;
pub const DEFAULT_PACK_SIZE: u64 = 20_000;

/// Credit settings. Always complete: bad input falls back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditConfig {
    /// Multiplier on raw model cost, within `MIN_MARKUP..=MAX_MARKUP`
    pub markup: f64,
    /// Credits included per subscription period
    pub subscription_allowance: u64,
    /// Credits per purchased pack, never zero
    pub pack_size: u64,
    /// Charge nothing (self-hosted deployments)
    pub unrestricted: bool,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            markup: DEFAULT_MARKUP,
            subscription_allowance: DEFAULT_SUBSCRIPTION_CREDITS,
            pack_size: DEFAULT_PACK_SIZE,
            unrestricted: false,
        }
    }
}

impl CreditConfig {
    /// Load from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let markup = parse_or_default(&lookup, MARKUP_VAR, DEFAULT_MARKUP, |raw| {
            raw.parse::<f64>()
                .ok()
                .filter(|m| (MIN_MARKUP..=MAX_MARKUP).contains(m))
        });
        let subscription_allowance = parse_or_default(
            &lookup,
            SUBSCRIPTION_CREDITS_VAR,
            DEFAULT_SUBSCRIPTION_CREDITS,
            |raw| raw.parse::<u64>().ok(),
        );
        let pack_size = parse_or_default(&lookup, PACK_SIZE_VAR, DEFAULT_PACK_SIZE, |raw| {
            raw.parse::<u64>().ok().filter(|n| *n > 0)
        });
        let unrestricted = parse_or_default(&lookup, UNRESTRICTED_VAR, false, parse_flag);

        Self {
            markup,
            subscription_allowance,
            pack_size,
            unrestricted,
        }
    }
}

fn parse_or_default<F, T, P>(lookup: &F, key: &str, default: T, parse: P) -> T
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return default;
    }
    match parse(raw) {
        Some(value) => value,
        None => {
            tracing::warn!("Ignoring invalid value {:?} for {}, using default", raw, key);
            default
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
