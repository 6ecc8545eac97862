//! Yahoo Finance data provider.
//!
//! Fetches daily OHLCV bars and quotes from Yahoo's v8 chart API. Handles rate
//! limiting, retries with jittered exponential backoff, response parsing, and
//! the circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; parse failures surface as retryable network errors.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchError, MarketDataProvider};
use crate::config::EngineConfig;
use crate::domain::Bar;
use chrono::NaiveDate;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CHART_BASE: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
    quote_window_days: i64,
}

impl YahooProvider {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>, config: &EngineConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout())
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(500),
            quote_window_days: config.today_window_days,
        })
    }

    fn range_url(symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(start_ts);
        format!("{CHART_BASE}/{symbol}?period1={start_ts}&period2={end_ts}&interval=1d&events=history")
    }

    fn quote_url(symbol: &str, window_days: i64) -> String {
        format!("{CHART_BASE}/{symbol}?range={window_days}d&interval=1d")
    }

    /// Unwrap the chart envelope; a "Not Found" error means the symbol is unknown.
    fn into_chart_data(symbol: &str, resp: ChartResponse) -> Result<ChartData, FetchError> {
        if let Some(err) = resp.chart.error {
            return Err(if err.code == "Not Found" {
                FetchError::InvalidInstrument {
                    symbol: symbol.to_string(),
                }
            } else {
                FetchError::Network(format!("{}: {}", err.code, err.description))
            });
        }
        resp.chart
            .result
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| FetchError::Network(format!("empty chart result for {symbol}")))
    }

    /// Parse the chart payload into bars. A window with no sessions yields no bars.
    fn parse_bars(data: ChartData) -> Result<Vec<Bar>, FetchError> {
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };
        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Network("no quote data in chart response".into()))?;

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let date = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| FetchError::Network(format!("invalid timestamp: {ts}")))?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();

            // Rows with no close are placeholders for non-trading days.
            let Some(close) = close else { continue };

            bars.push(Bar {
                date,
                open: open.unwrap_or(close),
                high: high.unwrap_or(close),
                low: low.unwrap_or(close),
                close,
                volume: volume.unwrap_or(0),
            });
        }
        Ok(bars)
    }

    /// Backoff for `attempt` (1-based): base * 2^(attempt-1) plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let half_ms = u64::try_from(exp.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=half_ms);
        exp.saturating_add(Duration::from_millis(jitter_ms))
    }

    /// GET a chart URL with retry and circuit breaker logic.
    fn get_chart(&self, symbol: &str, url: &str) -> Result<ChartData, FetchError> {
        let refused = || FetchError::RateLimited {
            retry_after_secs: self.circuit_breaker.remaining_cooldown().as_secs(),
        };
        if !self.circuit_breaker.is_allowed() {
            return Err(refused());
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.backoff(attempt));
                if !self.circuit_breaker.is_allowed() {
                    return Err(refused());
                }
            }

            let resp = match self.client.get(url).send() {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(symbol, attempt, error = %e, "chart request failed");
                    last_error = Some(FetchError::Network(e.to_string()));
                    if e.is_connect() || e.is_timeout() {
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(refused());
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after_secs = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(FetchError::RateLimited { retry_after_secs });
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                // The body still carries the chart error envelope.
                if let Ok(chart) = resp.json::<ChartResponse>() {
                    return Self::into_chart_data(symbol, chart);
                }
                return Err(FetchError::InvalidInstrument {
                    symbol: symbol.to_string(),
                });
            }
            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(FetchError::Network(format!("HTTP {status} for {symbol}")));
                continue;
            }

            let chart: ChartResponse = resp
                .json()
                .map_err(|e| FetchError::Network(format!("failed to parse response for {symbol}: {e}")))?;
            let data = Self::into_chart_data(symbol, chart)?;
            self.circuit_breaker.record_success();
            return Ok(data);
        }

        let err = last_error.unwrap_or_else(|| FetchError::Network("max retries exceeded".into()));
        warn!(symbol, error = %err, "chart request gave up");
        Err(err)
    }
}

impl MarketDataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>, FetchError> {
        let data = self.get_chart(symbol, &Self::range_url(symbol, start, end))?;
        Self::parse_bars(data)
    }

    fn fetch_quote(&self, symbol: &str) -> Result<Option<f64>, FetchError> {
        let data = self.get_chart(symbol, &Self::quote_url(symbol, self.quote_window_days))?;
        if let Some(price) = data.meta.as_ref().and_then(|m| m.regular_market_price) {
            return Ok(Some(price));
        }
        Ok(Self::parse_bars(data)?.last().map(|b| b.close))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ChartResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_bars_and_skips_placeholder_rows() {
        let resp = parse(
            r#"{"chart":{"result":[{
                "meta":{"regularMarketPrice":101.5},
                "timestamp":[1704205800,1704292200,1704378600],
                "indicators":{"quote":[{
                    "open":[100.0,null,102.0],
                    "high":[101.0,null,103.0],
                    "low":[99.0,null,101.0],
                    "close":[100.5,null,102.5],
                    "volume":[1000,null,1200]
                }]}
            }],"error":null}}"#,
        );
        let data = YahooProvider::into_chart_data("SPY", resp).unwrap();
        assert_eq!(data.meta.as_ref().unwrap().regular_market_price, Some(101.5));
        let bars = YahooProvider::parse_bars(data).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[1].close, 102.5);
        assert_eq!(bars[1].volume, 1200);
    }

    #[test]
    fn not_found_maps_to_invalid_instrument() {
        let resp = parse(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        );
        let err = YahooProvider::into_chart_data("ZZZZ", resp).unwrap_err();
        assert_eq!(
            err,
            FetchError::InvalidInstrument {
                symbol: "ZZZZ".into()
            }
        );
    }

    #[test]
    fn window_without_sessions_yields_no_bars() {
        let resp = parse(r#"{"chart":{"result":[{"indicators":{"quote":[{}]}}],"error":null}}"#);
        let data = YahooProvider::into_chart_data("SPY", resp).unwrap();
        assert!(YahooProvider::parse_bars(data).unwrap().is_empty());
    }

    #[test]
    fn backoff_grows_without_overflow() {
        let provider = YahooProvider::new(Arc::new(CircuitBreaker::default_provider()), &EngineConfig::default()).unwrap();
        let first = provider.backoff(1);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(750));
        let second = provider.backoff(2);
        assert!(second >= Duration::from_millis(1000) && second <= Duration::from_millis(1500));
        assert!(provider.backoff(40) >= Duration::from_millis(500).saturating_mul(u32::MAX));
    }

    #[test]
    fn range_url_covers_whole_end_day() {
        let url = YahooProvider::range_url(
            "SPY",
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(1970, 1, 2).unwrap(),
        );
        assert!(url.contains("period1=0&"));
        assert!(url.contains("period2=172799&"));
    }
}
