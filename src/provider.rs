// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, o, Logger};

use crate::connection::{Connection, Connector};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::pool::ConnectionPool;

/// Connections idle for less than this skip the socket probe on reuse.
pub const EXTENSIVE_CHECK_AFTER: Duration = Duration::from_secs(10);

/// Timeouts applied to every connection a provider hands out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// The single place calls get connections from and give them back to.
/// Whether a connection came out of the pool or was just opened is
/// invisible to the caller.
pub struct ConnectionProvider {
    pool: ConnectionPool,
    connector: Arc<dyn Connector>,
    timeouts: Timeouts,
    log: Logger,
}

impl ConnectionProvider {
    pub fn new(
        pool: ConnectionPool,
        connector: Arc<dyn Connector>,
        timeouts: Timeouts,
        log: &Logger,
    ) -> ConnectionProvider {
        ConnectionProvider {
            pool,
            connector,
            timeouts,
            log: log.new(o!("component" => "provider")),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// A healthy pooled connection to `endpoint`, or a new one. Pooled
    /// connections failing the health check are closed and skipped.
    pub fn obtain(&self, endpoint: &Endpoint) -> Result<Connection> {
        while let Some(mut conn) = self.pool.get(endpoint) {
            let extensive = conn.idle_since().map_or(true, |since| {
                Instant::now().saturating_duration_since(since) >= EXTENSIVE_CHECK_AFTER
            });
            if conn.is_healthy(extensive) {
                conn.mark_in_use();
                debug!(self.log, "reusing pooled connection";
                    "connection" => conn.id(), "endpoint" => %endpoint);
                return Ok(conn);
            }
            debug!(self.log, "discarding unhealthy pooled connection";
                "connection" => conn.id(), "endpoint" => %endpoint);
            conn.close();
        }

        let mut conn = Connection::connect(
            endpoint,
            self.connector.as_ref(),
            self.timeouts.connect,
            &self.log,
        )?;
        conn.set_read_timeout(self.timeouts.read)?;
        conn.set_write_timeout(self.timeouts.write)?;
        Ok(conn)
    }

    pub fn recycle(&self, conn: Connection) {
        self.pool.recycle(conn);
    }

    /// Closes a connection whose byte stream can no longer be trusted.
    pub fn discard(&self, conn: Connection) {
        debug!(self.log, "discarding connection";
            "connection" => conn.id(), "endpoint" => %conn.endpoint());
        conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_KEEP_ALIVE;
    use crate::testing::{test_logger, MockConnector};

    fn provider(connector: &MockConnector) -> ConnectionProvider {
        let log = test_logger();
        ConnectionProvider::new(
            ConnectionPool::with_logger(5, DEFAULT_KEEP_ALIVE, Some(&log)),
            Arc::new(connector.clone()),
            Timeouts::default(),
            &log,
        )
    }

    #[test]
    fn opens_when_pool_is_empty_and_reuses_after_recycle() {
        let connector = MockConnector::new();
        connector.add();
        let provider = provider(&connector);
        let ep = Endpoint::new("mock", 1);

        let conn = provider.obtain(&ep).unwrap();
        let id = conn.id();
        provider.recycle(conn);
        let again = provider.obtain(&ep).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(connector.connects(), 1);
        provider.pool().evict_all();
    }

    #[test]
    fn skips_closed_pooled_connection() {
        let connector = MockConnector::new();
        connector.add();
        connector.add();
        let provider = provider(&connector);
        let ep = Endpoint::new("mock", 1);

        let conn = provider.obtain(&ep).unwrap();
        let stale_id = conn.id();
        provider.recycle(conn);
        // shut the pooled connection down behind the pool's back
        let pooled = provider.pool().get(&ep).unwrap();
        let control = pooled.control();
        provider.recycle(pooled);
        control.close();

        let fresh = provider.obtain(&ep).unwrap();
        assert_ne!(fresh.id(), stale_id);
        assert_eq!(connector.connects(), 2);
        assert_eq!(provider.pool().idle_count(), 0);
    }

    #[test]
    fn endpoints_do_not_share_connections() {
        let connector = MockConnector::new();
        connector.add();
        connector.add();
        let provider = provider(&connector);

        let conn = provider.obtain(&Endpoint::new("a", 1)).unwrap();
        provider.recycle(conn);
        let _other = provider.obtain(&Endpoint::new("b", 1)).unwrap();
        assert_eq!(connector.connects(), 2);
        assert_eq!(provider.pool().idle_count(), 1);
        provider.pool().evict_all();
    }

    #[test]
    fn discard_closes() {
        let connector = MockConnector::new();
        let transport = connector.add();
        let provider = provider(&connector);
        let conn = provider.obtain(&Endpoint::new("mock", 1)).unwrap();
        provider.discard(conn);
        assert_eq!(transport.shutdown_count(), 1);
        assert_eq!(provider.pool().idle_count(), 0);
    }
}
