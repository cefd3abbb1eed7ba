// Copyright 2020 Joyent, Inc.

//! Single request/response exchanges.
//!
//! A [`Call`] runs once. `execute` blocks the calling thread, `enqueue`
//! runs on the client's worker pool and `execute_timeout` waits a bounded
//! time for the worker. `cancel` may be called from any thread at any
//! point; it shuts the socket of an exchange in progress down, so a read
//! or write blocked on it returns right away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use slog::{debug, o, Logger};

use crate::connection::{Connection, ConnectionControl};
use crate::decode::ValueDecoder;
use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol;
use crate::provider::ConnectionProvider;
use crate::request::Request;
use crate::response::{Response, ResponseBody};

/// What every call made through one client shares.
pub(crate) struct CallContext {
    pub(crate) provider: Arc<ConnectionProvider>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) max_response_size: u32,
    pub(crate) log: Logger,
}

/// Execution state shared by calls and multi-calls: executed at most once,
/// cancellable, and aware of the connection currently in use.
pub(crate) struct Execution {
    executed: AtomicBool,
    cancelled: AtomicBool,
    in_flight: Mutex<Option<Arc<ConnectionControl>>>,
}

impl Execution {
    pub(crate) fn new() -> Execution {
        Execution {
            executed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            in_flight: Mutex::new(None),
        }
    }

    /// Fails if this was already started once.
    pub(crate) fn start(&self) -> Result<()> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::IllegalState("already executed"));
        }
        Ok(())
    }

    pub(crate) fn is_executed(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `conn` as the connection to close on cancel. Returns false,
    /// registering nothing, if the call was cancelled already.
    pub(crate) fn track(&self, conn: &Connection) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            return false;
        }
        *in_flight = Some(conn.control());
        true
    }

    pub(crate) fn untrack(&self) {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(control) = in_flight.as_ref() {
            control.close();
        }
    }

    /// The error to report for a failed exchange: a cancel wins over
    /// whatever the torn down socket produced.
    pub(crate) fn failure(&self, err: Error) -> Error {
        if self.is_cancelled() {
            Error::Cancelled
        } else {
            err
        }
    }
}

struct CallInner {
    request: Request,
    endpoint: Endpoint,
    context: Arc<CallContext>,
    execution: Execution,
    log: Logger,
}

/// A prepared exchange. Clones refer to the same call, so one thread can
/// cancel what another is executing.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(request: Request, endpoint: Endpoint, context: Arc<CallContext>) -> Call {
        let log = context.log.new(o!(
            "method" => request.method().to_string(),
            "endpoint" => endpoint.to_string()
        ));
        Call {
            inner: Arc::new(CallInner {
                request,
                endpoint,
                context,
                execution: Execution::new(),
                log,
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Sends the request and returns once the response header arrived.
    /// The response body streams from the connection; it is decoded as
    /// the caller reads it.
    pub fn execute(&self) -> Result<Response> {
        self.inner.execution.start()?;
        self.inner.run()
    }

    /// Like `execute`, on a worker thread. `callback` receives the outcome.
    pub fn enqueue<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.inner.execution.start()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .dispatcher
            .spawn(move || callback(inner.run()))
    }

    /// Like `execute`, giving up after `timeout`. A call that times out is
    /// cancelled, which closes its connection.
    pub fn execute_timeout(&self, timeout: Duration) -> Result<Response> {
        self.inner.execution.start()?;
        let inner = Arc::clone(&self.inner);
        let result = self.inner.context.dispatcher.run_with_timeout(
            timeout,
            move || inner.run(),
            || self.cancel(),
        );
        if let Err(Error::Timeout(_)) = result {
            debug!(self.inner.log, "call timed out"; "timeout_ms" => timeout.as_millis() as u64);
        }
        result
    }

    /// Aborts the call. Safe to call repeatedly and from any thread.
    pub fn cancel(&self) {
        self.inner.execution.cancel();
    }

    pub fn is_executed(&self) -> bool {
        self.inner.execution.is_executed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.execution.is_cancelled()
    }
}

impl CallInner {
    fn run(&self) -> Result<Response> {
        if self.execution.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut frame = BytesMut::new();
        protocol::encode_request(&self.request, None, &mut frame)?;

        let provider = &self.context.provider;
        let mut conn = provider.obtain(&self.endpoint)?;
        if !self.execution.track(&conn) {
            provider.discard(conn);
            return Err(Error::Cancelled);
        }

        let exchanged = self.exchange(&mut conn, &frame);
        self.execution.untrack();
        match exchanged {
            Ok(decoder) if !self.execution.is_cancelled() => {
                let body = ResponseBody::streaming(conn, Arc::clone(provider), decoder, &self.log);
                Ok(Response::new(self.endpoint.clone(), None, body))
            }
            Ok(_) => {
                provider.discard(conn);
                Err(Error::Cancelled)
            }
            Err(e) => {
                debug!(self.log, "call failed"; "connection" => conn.id(), "error" => %e);
                provider.discard(conn);
                Err(self.execution.failure(e))
            }
        }
    }

    fn exchange(&self, conn: &mut Connection, frame: &[u8]) -> Result<ValueDecoder> {
        let sent = protocol::write_request(&self.request, frame, conn.writer())?;
        debug!(self.log, "sent request"; "connection" => conn.id(), "bytes" => sent);
        ValueDecoder::read_header(conn.reader(), self.context.max_response_size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, DEFAULT_KEEP_ALIVE};
    use crate::protocol::decode_request;
    use crate::provider::Timeouts;
    use crate::request::Param;
    use crate::testing::{test_logger, MockConnector};
    use serde_json::json;
    use std::sync::mpsc;

    pub(crate) fn context(connector: &MockConnector) -> Arc<CallContext> {
        let log = test_logger();
        Arc::new(CallContext {
            provider: Arc::new(ConnectionProvider::new(
                ConnectionPool::with_logger(5, DEFAULT_KEEP_ALIVE, Some(&log)),
                Arc::new(connector.clone()),
                Timeouts::default(),
                &log,
            )),
            dispatcher: Dispatcher::new(8, &log),
            max_response_size: 1 << 20,
            log,
        })
    }

    fn call(request: Request, context: &Arc<CallContext>) -> Call {
        Call::new(request, Endpoint::new("mock", 1), Arc::clone(context))
    }

    #[test]
    fn executes_and_recycles_after_drain() {
        let connector = MockConnector::new();
        let transport = connector.add();
        transport.push_response(&json!({"echo": "hi"}), None);
        let ctx = context(&connector);

        let c = call(Request::builder("echo").param("msg", "hi").build(), &ctx);
        let mut response = c.execute().unwrap();
        assert_eq!(response.values().unwrap()["echo"], "hi");
        response.close();

        let sent = decode_request(&mut &transport.written()[..]).unwrap();
        assert_eq!(sent.method, "echo");
        assert_eq!(sent.param("msg"), Some(&Param::Str("hi".to_string())));
        assert_eq!(ctx.provider.pool().idle_count(), 1);
        ctx.provider.pool().evict_all();
    }

    #[test]
    fn second_execute_is_illegal() {
        let connector = MockConnector::new();
        connector.add().push_response(&json!({}), None);
        let ctx = context(&connector);
        let c = call(Request::new("m"), &ctx);
        c.execute().unwrap().close();
        assert!(matches!(c.execute(), Err(Error::IllegalState(_))));
        ctx.provider.pool().evict_all();
    }

    #[test]
    fn size_limit_fails_before_connecting() {
        let connector = MockConnector::new();
        let ctx = context(&connector);
        let c = call(Request::new("m".repeat(128)), &ctx);
        assert!(matches!(c.execute(), Err(Error::SizeLimit(_))));
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn io_failure_discards_connection() {
        let connector = MockConnector::new();
        let transport = connector.add();
        transport.push_incoming(&[1, 0]);
        transport.close_peer();
        let ctx = context(&connector);

        let res = call(Request::new("m"), &ctx).execute();
        assert!(matches!(res, Err(Error::Io(_))));
        assert_eq!(transport.shutdown_count(), 1);
        assert_eq!(ctx.provider.pool().idle_count(), 0);
    }

    #[test]
    fn oversized_response_is_protocol_error() {
        let connector = MockConnector::new();
        let transport = connector.add();
        transport.push_incoming(&(2u32 << 20).to_le_bytes());
        let ctx = context(&connector);
        let res = call(Request::new("m"), &ctx).execute();
        assert!(matches!(res, Err(Error::Protocol(_))));
        assert_eq!(transport.shutdown_count(), 1);
    }

    #[test]
    fn cancelled_before_execute() {
        let connector = MockConnector::new();
        let ctx = context(&connector);
        let c = call(Request::new("m"), &ctx);
        c.cancel();
        c.cancel();
        assert!(c.is_cancelled());
        assert!(matches!(c.execute(), Err(Error::Cancelled)));
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn enqueue_delivers_to_callback() {
        let connector = MockConnector::new();
        connector.add().push_response(&json!({"n": 5}), None);
        let ctx = context(&connector);
        let (tx, rx) = mpsc::channel();
        call(Request::new("m"), &ctx)
            .enqueue(move |res| {
                let n = res.and_then(|mut r| r.json::<serde_json::Value>());
                tx.send(n.map(|v| v["n"].clone()).ok()).unwrap();
            })
            .unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, Some(json!(5)));
    }
}
