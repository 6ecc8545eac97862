//! Live polling sessions.
//!
//! One session per instrument, shared by every consumer that attached to it.
//! An active session owns a timer thread that fetches today's bar every
//! `poll_interval` and merges it into the cache, holding the instrument's fetch
//! ticket across both steps. Each merge drops the instrument's memoized returns. Crypto polls around the clock; equities poll only inside the
//! extended-hours window, and no timer exists for them outside it.
//!
//! Consumers drive the poller directly or by sending `PollerCommand`s through
//! a channel to `spawn_command_loop`.

use crate::calendar::TradingCalendar;
use crate::clock::Clock;
use crate::data::{CacheStore, FetchGateway, FetchTickets};
use crate::domain::{AssetClass, Bar};
use crate::returns::{ReturnsCache, ReturnsKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No session (never attached, or every consumer detached).
    Idle,
    Active,
    Paused,
}

/// Messages from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerCommand {
    Attach(String),
    Detach(String),
    Pause,
    Resume,
    Shutdown,
}

/// Published after each bar merged by a poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveBarEvent {
    pub instrument: String,
    pub bar: Bar,
    pub polled_at: DateTime<Utc>,
}

struct SessionStatus {
    state: Mutex<SessionState>,
    last_polled_at: Mutex<Option<DateTime<Utc>>>,
    timer_running: AtomicBool,
}

impl SessionStatus {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

struct Session {
    subscribers: usize,
    status: Arc<SessionStatus>,
    /// Dropping the sender stops the timer thread.
    stop: Option<Sender<()>>,
}

struct PollerShared {
    cache: Arc<CacheStore>,
    gateway: Arc<FetchGateway>,
    tickets: Arc<FetchTickets>,
    calendar: TradingCalendar,
    clock: Arc<dyn Clock>,
    interval: Duration,
    events: Mutex<Option<Sender<LiveBarEvent>>>,
    /// Memoized returns dropped after each merge.
    returns: Mutex<Option<Arc<ReturnsCache>>>,
}

impl PollerShared {
    fn gate_open(&self, symbol: &str) -> bool {
        match AssetClass::of(symbol) {
            AssetClass::Crypto => true,
            AssetClass::Equity => self.calendar.is_extended_market_open(self.clock.now()),
        }
    }

    /// One poll: fetch today's bar and merge it, both under the instrument's
    /// ticket. Paused sessions skip the fetch.
    fn tick(&self, symbol: &str, status: &SessionStatus) -> Option<Bar> {
        if status.state() == SessionState::Paused {
            return None;
        }
        let polled_at = self.clock.now();
        *status.last_polled_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(polled_at);

        let ticket = self.tickets.ticket(symbol);
        let held = ticket.hold();
        let bar = match self.gateway.fetch_today_bar(symbol) {
            Ok(Some(bar)) => bar,
            Ok(None) => {
                debug!(symbol, "no bar yet");
                return None;
            }
            Err(e) => {
                warn!(symbol, error = %e, "live poll failed");
                return None;
            }
        };

        self.cache.merge(symbol, [bar]);
        drop(held);

        if let Some(returns) = self.returns.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            returns.invalidate(&ReturnsKey::Instrument(symbol.to_string()));
        }

        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(LiveBarEvent {
                instrument: symbol.to_string(),
                bar,
                polled_at,
            });
        }
        Some(bar)
    }
}

fn run_timer(shared: Arc<PollerShared>, symbol: String, status: Arc<SessionStatus>, stop: Receiver<()>) {
    loop {
        if !shared.gate_open(&symbol) {
            debug!(symbol = %symbol, "extended hours over, stopping timer");
            break;
        }
        shared.tick(&symbol, &status);
        match stop.recv_timeout(shared.interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    status.timer_running.store(false, Ordering::Release);
}

pub struct LivePoller {
    shared: Arc<PollerShared>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl LivePoller {
    pub fn new(
        cache: Arc<CacheStore>,
        gateway: Arc<FetchGateway>,
        tickets: Arc<FetchTickets>,
        calendar: TradingCalendar,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                cache,
                gateway,
                tickets,
                calendar,
                clock,
                interval,
                events: Mutex::new(None),
                returns: Mutex::new(None),
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Publish every merged bar on `tx`. Replaces any previous sink.
    pub fn set_event_sink(&self, tx: Sender<LiveBarEvent>) {
        *self.shared.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Invalidate the instrument's memoized returns after every merged bar.
    pub fn set_returns_cache(&self, returns: Arc<ReturnsCache>) {
        *self.shared.returns.lock().unwrap_or_else(|e| e.into_inner()) = Some(returns);
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a timer for the session unless one is running or the gate is closed.
    fn ensure_timer(&self, symbol: &str, session: &mut Session) {
        if session.status.timer_running.load(Ordering::Acquire) || !self.shared.gate_open(symbol) {
            return;
        }
        let (tx, rx) = mpsc::channel();
        session.status.timer_running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let status = Arc::clone(&session.status);
        let name = symbol.to_string();
        let spawned = thread::Builder::new()
            .name(format!("marketcache-poll-{symbol}"))
            .spawn(move || run_timer(shared, name, status, rx));
        match spawned {
            Ok(_) => session.stop = Some(tx),
            Err(e) => {
                warn!(symbol, error = %e, "failed to spawn poll timer");
                session.status.timer_running.store(false, Ordering::Release);
            }
        }
    }

    /// Join (or create) the instrument's session. Returns the subscriber count.
    pub fn attach(&self, symbol: &str) -> usize {
        let mut sessions = self.sessions();
        let session = sessions.entry(symbol.to_string()).or_insert_with(|| {
            info!(symbol, "live session started");
            Session {
                subscribers: 0,
                status: Arc::new(SessionStatus {
                    state: Mutex::new(SessionState::Active),
                    last_polled_at: Mutex::new(None),
                    timer_running: AtomicBool::new(false),
                }),
                stop: None,
            }
        });
        session.subscribers += 1;
        let count = session.subscribers;
        if session.status.state() == SessionState::Active {
            self.ensure_timer(symbol, session);
        }
        count
    }

    /// Leave the instrument's session. The last detach stops its timer and
    /// discards the session without waiting for an in-flight poll.
    pub fn detach(&self, symbol: &str) -> usize {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(symbol) else {
            return 0;
        };
        session.subscribers = session.subscribers.saturating_sub(1);
        let remaining = session.subscribers;
        if remaining == 0 {
            sessions.remove(symbol);
            info!(symbol, "live session released");
        }
        remaining
    }

    /// Suspend polling for every session.
    pub fn pause(&self) {
        for session in self.sessions().values() {
            if session.status.state() == SessionState::Active {
                session.status.set_state(SessionState::Paused);
            }
        }
    }

    /// Resume every paused session, restarting timers where the gate allows.
    pub fn resume(&self) {
        let mut sessions = self.sessions();
        for (symbol, session) in sessions.iter_mut() {
            if session.status.state() == SessionState::Paused {
                session.status.set_state(SessionState::Active);
            }
            self.ensure_timer(symbol, session);
        }
    }

    /// Start timers for active sessions whose gate has reopened (e.g. equities
    /// at the start of extended hours).
    pub fn reschedule(&self) {
        let mut sessions = self.sessions();
        for (symbol, session) in sessions.iter_mut() {
            if session.status.state() == SessionState::Active {
                self.ensure_timer(symbol, session);
            }
        }
    }

    /// Poll one attached instrument immediately, outside its timer.
    pub fn poll_now(&self, symbol: &str) -> Option<Bar> {
        let status = self.sessions().get(symbol).map(|s| Arc::clone(&s.status))?;
        if !self.shared.gate_open(symbol) {
            return None;
        }
        self.shared.tick(symbol, &status)
    }

    pub fn session_state(&self, symbol: &str) -> SessionState {
        self.sessions()
            .get(symbol)
            .map_or(SessionState::Idle, |s| s.status.state())
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.sessions().get(symbol).map_or(0, |s| s.subscribers)
    }

    /// Whether a timer thread is currently scheduled for the instrument.
    pub fn is_polling(&self, symbol: &str) -> bool {
        self.sessions()
            .get(symbol)
            .is_some_and(|s| s.status.timer_running.load(Ordering::Acquire))
    }

    pub fn last_polled_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let sessions = self.sessions();
        let session = sessions.get(symbol)?;
        let polled = *session.status.last_polled_at.lock().unwrap_or_else(|e| e.into_inner());
        polled
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every session and stop every timer.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions();
        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "live poller shutting down");
        }
        sessions.clear();
    }

    /// Apply one command.
    pub fn handle(&self, command: PollerCommand) {
        match command {
            PollerCommand::Attach(symbol) => {
                self.attach(&symbol);
            }
            PollerCommand::Detach(symbol) => {
                self.detach(&symbol);
            }
            PollerCommand::Pause => self.pause(),
            PollerCommand::Resume => self.resume(),
            PollerCommand::Shutdown => self.shutdown(),
        }
    }
}

/// Run `poller` off a command channel until `Shutdown` or until every sender
/// is dropped.
pub fn spawn_command_loop(poller: Arc<LivePoller>, rx: Receiver<PollerCommand>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("marketcache-poller".into())
        .spawn(move || {
            while let Ok(command) = rx.recv() {
                let done = command == PollerCommand::Shutdown;
                poller.handle(command);
                if done {
                    return;
                }
            }
            poller.shutdown();
        })
}
