//! Provider access and the persistent series cache.

pub mod cache;
pub mod circuit_breaker;
pub mod gateway;
pub mod provider;
pub mod tickets;
pub mod yahoo;

pub use cache::{CacheError, CacheStatus, CacheStore};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use gateway::{BatchFetchOutcome, CancelToken, FetchGateway};
pub use provider::{ChunkOutcome, FetchError, MarketDataProvider};
pub use tickets::{FetchTicket, FetchTickets};
pub use yahoo::YahooProvider;
