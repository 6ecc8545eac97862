//! Instrument identifiers and asset-class classification.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Quote-currency suffixes that mark a crypto pair (e.g. `BTC-USD`).
const CRYPTO_SUFFIXES: &[&str] = &["-USD", "-USDT", "-USDC"];

/// Asset class, as far as freshness and polling are concerned.
///
/// Crypto trades around the clock; equities follow the exchange calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Crypto,
}

impl AssetClass {
    /// Classify an instrument identifier by naming convention.
    pub fn of(symbol: &str) -> Self {
        let upper = symbol.trim().to_ascii_uppercase();
        if CRYPTO_SUFFIXES.iter().any(|s| upper.ends_with(s) && upper.len() > s.len()) {
            AssetClass::Crypto
        } else {
            AssetClass::Equity
        }
    }

    pub fn is_crypto(self) -> bool {
        self == AssetClass::Crypto
    }
}

/// Canonical form of an identifier: trimmed and upper-cased.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Normalize a list of identifiers, dropping blanks and duplicates while
/// keeping the first occurrence's position.
pub fn normalize_symbols<S: AsRef<str>>(symbols: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(symbols.len());
    symbols
        .iter()
        .map(|s| normalize_symbol(s.as_ref()))
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
