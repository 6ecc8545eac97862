//! Domain types: bars, series, instruments.

pub mod bar;
pub mod instrument;

pub use bar::{Bar, BarSeries};
pub use instrument::{normalize_symbol, normalize_symbols, AssetClass};
