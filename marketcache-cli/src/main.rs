//! MarketCache CLI: fetch, batch refresh, live watch, returns, and cache management.
//!
//! Commands:
//! - `fetch`: fetch-with-cache for one or more instruments
//! - `batch`: classify and refresh a list of instruments with progress
//! - `status`: report cached date ranges and freshness
//! - `clear`: remove one instrument or the whole cache
//! - `watch`: live-poll instruments and print merged bars
//! - `returns`: daily returns for an instrument or a weighted portfolio
//! - `export-csv`: write a cached series (optionally resampled) as CSV

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marketcache_core::domain::normalize_symbol;
use marketcache_core::{
    BatchOptions, EngineConfig, Interval, LiveBarEvent, MarketDataService, ReturnsKey, ServiceError,
    StdoutProgress,
};

#[derive(Parser)]
#[command(name = "marketcache", about = "MarketCache CLI: cached market data with batch and live refresh")]
struct Cli {
    /// Path to a TOML engine config. Missing keys use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory. Overrides the config file; defaults to the user cache dir.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch history for instruments, reusing the cache when it is current.
    Fetch {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Refresh many instruments at once.
    Batch {
        /// Instruments to refresh.
        symbols: Vec<String>,

        /// File with one instrument per line (blank lines and `#` comments ignored).
        #[arg(long)]
        file: Option<PathBuf>,

        /// Serve stale cached data for instruments whose fetch fails.
        #[arg(long, default_value_t = false)]
        fallback_to_stale: bool,
    },
    /// Report cached date ranges and freshness.
    Status {
        /// Instruments to report. Defaults to everything cached.
        symbols: Vec<String>,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove cached data.
    Clear {
        /// Instrument to remove. Omit with --all to wipe the cache.
        symbol: Option<String>,

        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Live-poll instruments and print each merged bar.
    Watch {
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Stop after this many bars. Runs until killed when omitted.
        #[arg(long)]
        max_events: Option<usize>,
    },
    /// Daily returns for an instrument or a weighted portfolio.
    Returns {
        /// Instrument symbol. Ignored when --portfolio is given.
        symbol: Option<String>,

        /// Portfolio weights, e.g. `SPY=0.6,TLT=0.4`.
        #[arg(long)]
        portfolio: Option<String>,

        /// Append today's live return when the expected bar is missing.
        #[arg(long, default_value_t = false)]
        live: bool,

        /// Number of most recent points to print.
        #[arg(long, default_value_t = 10)]
        tail: usize,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Export a cached series as CSV.
    ExportCsv {
        symbol: String,

        /// Output file. Writes to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,

        /// daily, weekly, monthly or yearly.
        #[arg(long, default_value = "daily")]
        interval: Interval,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.cache_dir)?;
    let service = MarketDataService::with_yahoo(config)?;

    match cli.command {
        Commands::Fetch { symbols } => run_fetch(&service, &symbols),
        Commands::Batch {
            symbols,
            file,
            fallback_to_stale,
        } => run_batch(&service, symbols, file.as_deref(), fallback_to_stale),
        Commands::Status { symbols, json } => run_status(&service, symbols, json),
        Commands::Clear { symbol, all } => run_clear(&service, symbol, all),
        Commands::Watch { symbols, max_events } => run_watch(&service, &symbols, max_events),
        Commands::Returns {
            symbol,
            portfolio,
            live,
            tail,
            json,
        } => run_returns(&service, symbol, portfolio, live, tail, json),
        Commands::ExportCsv { symbol, out, interval } => run_export(&service, &symbol, out.as_deref(), interval),
    }
}

/// Config file (if any), then the `--cache-dir` flag. Without either, the
/// cache lives under the platform cache directory.
fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(p) => EngineConfig::from_file(p).with_context(|| format!("loading config {}", p.display()))?,
        None => EngineConfig {
            cache_root: default_cache_root(),
            ..EngineConfig::default()
        },
    };
    if let Some(dir) = cache_dir {
        config.cache_root = dir;
    }
    Ok(config)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("marketcache"))
        .unwrap_or_else(|| EngineConfig::default().cache_root)
}

fn run_fetch(service: &MarketDataService, symbols: &[String]) -> Result<()> {
    let mut failures = 0;
    for symbol in symbols {
        match service.fetch_history(symbol) {
            Ok(series) => match (series.first_date(), series.last_date()) {
                (Some(first), Some(last)) => {
                    println!("{symbol}: {} bars, {first} to {last}", series.len());
                }
                _ => println!("{symbol}: no bars"),
            },
            Err(ServiceError::InvalidInstrument(s)) => {
                eprintln!("{s}: not a valid instrument");
                failures += 1;
            }
            Err(e) => {
                eprintln!("{symbol}: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_batch(
    service: &MarketDataService,
    mut symbols: Vec<String>,
    file: Option<&Path>,
    fallback_to_stale: bool,
) -> Result<()> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        symbols.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    if symbols.is_empty() {
        bail!("no instruments given: pass symbols or --file");
    }

    let report = service.fetch_history_batch(&symbols, &StdoutProgress, None, BatchOptions { fallback_to_stale });

    println!();
    println!("=== Batch Result ===");
    println!("Requested:      {}", symbols.len());
    println!("Served:         {}", report.series.len());
    println!("From cache:     {}", report.from_cache);
    println!("Fetched:        {}", report.fetched);
    println!("Stale fallback: {}", report.stale_fallback.len());
    println!("Failed:         {}", report.failed.len());
    for symbol in &report.failed {
        match report.errors.get(symbol) {
            Some(err) => eprintln!("  {symbol}: {err}"),
            None => eprintln!("  {symbol}: no data"),
        }
    }
    info!(served = report.series.len(), failed = report.failed.len(), "batch finished");

    if !report.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(service: &MarketDataService, symbols: Vec<String>, json: bool) -> Result<()> {
    let symbols = if symbols.is_empty() {
        service.cached_instruments()
    } else {
        symbols
    };
    let statuses = service.cache_status(&symbols);

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    let root = service.cache().root();
    if statuses.is_empty() {
        println!("Cache is empty: {}", root.display());
        return Ok(());
    }

    println!("Cache: {}", root.display());
    println!("Schema version: {}", service.cache().current_version_tag());
    println!("Total size: {}", format_size(dir_size(root)));
    println!();
    println!(
        "{:<12} {:<25} {:>8} {:<8}",
        "Symbol", "Date Range", "Bars", "Fresh"
    );
    println!("{}", "-".repeat(56));
    for status in &statuses {
        let range = match (status.start_date, status.end_date) {
            (Some(s), Some(e)) => format!("{s} to {e}"),
            _ => "(not cached)".into(),
        };
        let verdict = service.freshness_of(&status.symbol);
        let fresh = if verdict.is_current {
            "yes".to_string()
        } else {
            format!("no (<{})", verdict.expected_last_date)
        };
        println!(
            "{:<12} {:<25} {:>8} {:<8}",
            status.symbol,
            range,
            status.bar_count.unwrap_or(0),
            fresh
        );
    }
    Ok(())
}

fn run_clear(service: &MarketDataService, symbol: Option<String>, all: bool) -> Result<()> {
    match (symbol, all) {
        (Some(_), true) => bail!("pass a symbol or --all, not both"),
        (Some(s), false) => {
            service.clear_cache(Some(&s));
            println!("Removed: {s}");
        }
        (None, true) => {
            service.clear_cache(None);
            println!("Cache cleared: {}", service.cache().root().display());
        }
        (None, false) => bail!("pass a symbol or --all"),
    }
    Ok(())
}

fn run_watch(service: &MarketDataService, symbols: &[String], max_events: Option<usize>) -> Result<()> {
    let poller = service.live_poller();
    let (tx, rx) = mpsc::channel::<LiveBarEvent>();
    poller.set_event_sink(tx);
    for symbol in symbols {
        poller.attach(&normalize_symbol(symbol));
    }
    info!(instruments = symbols.len(), interval_secs = service.config().poll_interval_secs, "watching");

    let mut seen = 0usize;
    loop {
        match rx.recv_timeout(Duration::from_secs(60)) {
            Ok(event) => {
                let bar = event.bar;
                println!(
                    "{} {} {}  O {:.2}  H {:.2}  L {:.2}  C {:.2}  V {}",
                    event.polled_at.format("%H:%M:%S"),
                    event.instrument,
                    bar.date,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                );
                seen += 1;
                if max_events.is_some_and(|max| seen >= max) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Sessions opening later in the day need their timers started.
                poller.reschedule();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    poller.shutdown();
    Ok(())
}

fn run_returns(
    service: &MarketDataService,
    symbol: Option<String>,
    portfolio: Option<String>,
    live: bool,
    tail: usize,
    json: bool,
) -> Result<()> {
    let key = match (portfolio, symbol) {
        (Some(spec), _) => {
            let weights = parse_weights(&spec)?;
            for (s, _) in &weights {
                service.fetch_history(s)?;
            }
            service.register_portfolio("cli", weights);
            ReturnsKey::Portfolio("cli".into())
        }
        (None, Some(s)) => {
            service.fetch_history(&s)?;
            ReturnsKey::Instrument(normalize_symbol(&s))
        }
        (None, None) => bail!("pass a symbol or --portfolio"),
    };

    let Some(returns) = service.daily_returns(&key, live) else {
        bail!("no cached data for {key:?}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&returns)?);
        return Ok(());
    }

    let skip = returns.len().saturating_sub(tail);
    for (date, r) in returns.points.iter().skip(skip) {
        println!("{date}  {:>+8.3}%", r * 100.0);
    }
    Ok(())
}

/// `SYM=weight,SYM=weight`.
fn parse_weights(spec: &str) -> Result<Vec<(String, f64)>> {
    spec.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let Some((sym, w)) = part.split_once('=') else {
                bail!("expected SYM=weight, got '{part}'");
            };
            let weight: f64 = w.trim().parse().with_context(|| format!("bad weight in '{part}'"))?;
            Ok((sym.trim().to_string(), weight))
        })
        .collect()
}

fn run_export(service: &MarketDataService, symbol: &str, out: Option<&Path>, interval: Interval) -> Result<()> {
    let Some(series) = service.get_cached_resampled(symbol, interval) else {
        bail!("{symbol} is not cached; run `marketcache fetch {symbol}` first");
    };

    let writer: Box<dyn std::io::Write> = match out {
        Some(path) => Box::new(std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut csv = csv::Writer::from_writer(writer);
    for bar in series.bars() {
        csv.serialize(bar)?;
    }
    csv.flush()?;

    if let Some(path) = out {
        info!(symbol, bars = series.len(), path = %path.display(), "exported");
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let mut size = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                size += meta.len();
            }
        }
    }
    size
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
