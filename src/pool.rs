// Copyright 2020 Joyent, Inc.

//! Idle connection cache.
//!
//! Connections are kept most-recently-idled first. A background thread,
//! started by the first `recycle` and gone again once the pool is empty,
//! closes connections that stayed idle longer than the keep-alive or that
//! push the idle count over the limit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, o, warn, Drain, Logger};

use crate::connection::Connection;
use crate::endpoint::Endpoint;

pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

struct PoolState {
    idle: VecDeque<Connection>,
    cleanup_running: bool,
}

struct PoolInner {
    max_idle: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    wakeup: Condvar,
    log: Logger,
}

/// Connection pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(max_idle: usize, keep_alive: Duration) -> ConnectionPool {
        ConnectionPool::with_logger(max_idle, keep_alive, None)
    }

    pub fn with_logger(
        max_idle: usize,
        keep_alive: Duration,
        log: Option<&Logger>,
    ) -> ConnectionPool {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max_idle,
                keep_alive,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    cleanup_running: false,
                }),
                wakeup: Condvar::new(),
                log: log.new(o!("component" => "pool")),
            }),
        }
    }

    pub fn max_idle_connections(&self) -> usize {
        self.inner.max_idle
    }

    pub fn keep_alive(&self) -> Duration {
        self.inner.keep_alive
    }

    /// Removes and returns the most recently idled connection to
    /// `endpoint`. Its idle stamp is left in place for the health check.
    pub fn get(&self, endpoint: &Endpoint) -> Option<Connection> {
        let mut state = self.inner.lock();
        let pos = state.idle.iter().position(|c| c.endpoint() == endpoint)?;
        state.idle.remove(pos)
    }

    /// Puts `conn` back for reuse. Closed connections, and every connection
    /// when the pool keeps none idle, are closed and dropped instead.
    pub fn recycle(&self, mut conn: Connection) {
        if conn.is_closed() {
            debug!(self.inner.log, "dropping closed connection"; "connection" => conn.id());
            return;
        }
        if self.inner.max_idle == 0 {
            conn.close();
            return;
        }

        conn.mark_idle(Instant::now());
        let conn_id = conn.id();
        let mut state = self.inner.lock();
        state.idle.push_front(conn);
        if !state.cleanup_running {
            state.cleanup_running = true;
            drop(state);
            self.spawn_cleanup();
        } else {
            drop(state);
            self.inner.wakeup.notify_all();
        }
        debug!(self.inner.log, "recycled connection"; "connection" => conn_id);
    }

    /// One eviction pass at time `now`. Closes at most one connection.
    ///
    /// Returns `Some(Duration::ZERO)` after evicting (run again right away),
    /// `Some(wait)` when the next eviction is due in `wait`, and `None` once
    /// the pool is empty. Only the background loop ends itself on `None`.
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        let mut state = self.inner.lock();
        let (next, evicted) = self.inner.cleanup_pass(&mut state, now);
        drop(state);
        if let Some(conn) = evicted {
            conn.close();
        }
        next
    }

    /// Closes and removes every idle connection.
    pub fn evict_all(&self) {
        let evicted: Vec<Connection> = {
            let mut state = self.inner.lock();
            state.idle.drain(..).collect()
        };
        for conn in &evicted {
            conn.close();
        }
        self.inner.wakeup.notify_all();
        if !evicted.is_empty() {
            debug!(self.inner.log, "evicted all idle connections"; "count" => evicted.len());
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn idle_count_for(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .lock()
            .idle
            .iter()
            .filter(|c| c.endpoint() == endpoint)
            .count()
    }

    fn spawn_cleanup(&self) {
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name("binrpc-pool-cleanup".to_string())
            .spawn(move || pool.run_cleanup());
        if let Err(e) = spawned {
            // Without the loop nothing would ever be evicted, so keep
            // nothing idle.
            warn!(self.inner.log, "failed to start pool cleanup"; "error" => %e);
            self.inner.lock().cleanup_running = false;
            self.evict_all();
        }
    }

    fn run_cleanup(&self) {
        // The decision and the wait happen under one lock acquisition so a
        // recycle between them cannot be missed.
        let mut state = self.inner.lock();
        loop {
            let (next, evicted) = self.inner.cleanup_pass(&mut state, Instant::now());
            if let Some(conn) = evicted {
                drop(state);
                conn.close();
                state = self.inner.lock();
                continue;
            }
            match next {
                None => {
                    state.cleanup_running = false;
                    return;
                }
                Some(wait) => {
                    state = self
                        .inner
                        .wakeup
                        .wait_timeout(state, wait)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Pool state stays consistent across a panicking holder: every
        // mutation is a single push or remove.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cleanup_pass(
        &self,
        state: &mut PoolState,
        now: Instant,
    ) -> (Option<Duration>, Option<Connection>) {
        let mut longest: Option<(usize, Duration)> = None;
        for (idx, conn) in state.idle.iter().enumerate() {
            let idle_for = conn
                .idle_since()
                .map_or(Duration::from_secs(0), |t| now.saturating_duration_since(t));
            if longest.map_or(true, |(_, d)| idle_for >= d) {
                longest = Some((idx, idle_for));
            }
        }

        match longest {
            Some((idx, idle_for))
                if idle_for >= self.keep_alive || state.idle.len() > self.max_idle =>
            {
                let evicted = state.idle.remove(idx);
                if let Some(conn) = &evicted {
                    debug!(self.log, "evicting idle connection";
                        "connection" => conn.id(),
                        "endpoint" => %conn.endpoint(),
                        "idle_ms" => idle_for.as_millis() as u64);
                }
                (Some(Duration::from_secs(0)), evicted)
            }
            Some((_, idle_for)) => (Some(self.keep_alive - idle_for), None),
            None => (None, None),
        }
    }
}
