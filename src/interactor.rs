// Copyright 2020 Joyent, Inc.

//! Pull-based pipelining over a multi-call.
//!
//! An [`Interactor`] writes requests when its caller asks it to and reads
//! responses one at a time, so a caller can keep a bounded number of
//! requests in flight on one connection. Each response must be drained
//! (or closed) before the next one is read. Responses before the last are
//! read into memory, payload included; the last response of the batch
//! streams and takes the connection with it.

use std::cmp;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use slog::debug;

use crate::connection::Connection;
use crate::decode::{read_buffered, ValueDecoder};
use crate::error::{Error, Result};
use crate::multicall::MultiCallInner;
use crate::protocol::{self, ID_PARAM};
use crate::response::{Response, ResponseBody};

struct Session {
    conn: Option<Connection>,
    answered: Vec<bool>,
    previous: Option<Arc<AtomicBool>>,
    failed: bool,
}

pub struct Interactor {
    call: Arc<MultiCallInner>,
    frames: Vec<BytesMut>,
    written: AtomicUsize,
    read: AtomicUsize,
    closed: AtomicBool,
    session: Mutex<Session>,
}

impl Interactor {
    pub(crate) fn new(call: Arc<MultiCallInner>, frames: Vec<BytesMut>) -> Interactor {
        let total = frames.len();
        Interactor {
            call,
            frames,
            written: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            session: Mutex::new(Session {
                conn: None,
                answered: vec![false; total],
                previous: None,
                failed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self, session: &Session) -> Result<()> {
        if self.call.execution.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("interactor is closed"));
        }
        if session.failed {
            return Err(Error::IllegalState("interactor failed"));
        }
        Ok(())
    }

    /// Writes up to `count` of the requests not sent yet and returns how
    /// many were written. The connection is obtained on first use.
    pub fn submit_requests(&self, count: usize) -> Result<usize> {
        let mut session = self.lock();
        self.check_open(&session)?;
        let start = self.written.load(Ordering::SeqCst);
        let end = cmp::min(self.frames.len(), start.saturating_add(count));
        if start == end {
            return Ok(0);
        }

        if session.conn.is_none() {
            let provider = &self.call.context.provider;
            let conn = provider.obtain(&self.call.endpoint)?;
            if !self.call.execution.track(&conn) {
                provider.discard(conn);
                return Err(Error::Cancelled);
            }
            session.conn = Some(conn);
        }

        for index in start..end {
            let sent = match session.conn.as_mut() {
                Some(conn) => protocol::write_request(
                    &self.call.requests[index],
                    &self.frames[index],
                    conn.writer(),
                ),
                None => Err(Error::IllegalState("interactor has no connection")),
            };
            if let Err(e) = sent {
                return Err(self.fail(&mut session, e));
            }
            self.written.store(index + 1, Ordering::SeqCst);
        }
        debug!(self.call.log, "submitted requests"; "from" => start, "to" => end);
        Ok(end - start)
    }

    /// True while a written request still awaits its response.
    pub fn has_next_response(&self) -> bool {
        self.read.load(Ordering::SeqCst) < self.written.load(Ordering::SeqCst)
    }

    /// Reads the next response in the order the server sends them.
    pub fn next_response(&self) -> Result<Response> {
        let mut session = self.lock();
        self.check_open(&session)?;
        let read = self.read.load(Ordering::SeqCst);
        if read >= self.written.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("no submitted request awaits a response"));
        }
        if let Some(previous) = session.previous.as_ref() {
            if !previous.load(Ordering::SeqCst) {
                return Err(Error::IllegalState("previous response was not drained"));
            }
        }

        let last = read + 1 == self.frames.len();
        let received = if last {
            self.read_streaming(&mut session)
        } else {
            self.read_buffered(&mut session)
        };
        match received {
            Ok(response) => {
                self.read.store(read + 1, Ordering::SeqCst);
                session.previous = Some(response.finished_flag());
                Ok(response)
            }
            Err(e) => Err(self.fail(&mut session, e)),
        }
    }

    /// Requests not written yet.
    pub fn remaining_requests(&self) -> usize {
        self.frames.len() - self.written.load(Ordering::SeqCst)
    }

    /// Responses returned so far.
    pub fn handled_responses(&self) -> usize {
        self.read.load(Ordering::SeqCst)
    }

    /// Ends the session. The connection goes back to the pool only if every
    /// written request had its response read; otherwise it is closed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut session = self.lock();
        let conn = session.conn.take();
        self.call.execution.untrack();
        if let Some(conn) = conn {
            let provider = &self.call.context.provider;
            let clean = !session.failed
                && self.read.load(Ordering::SeqCst) == self.written.load(Ordering::SeqCst);
            if clean {
                provider.recycle(conn);
            } else {
                debug!(self.call.log, "closing interactor with unread responses";
                    "connection" => conn.id(),
                    "written" => self.written.load(Ordering::SeqCst),
                    "read" => self.read.load(Ordering::SeqCst));
                provider.discard(conn);
            }
        }
    }

    fn read_buffered(&self, session: &mut Session) -> Result<Response> {
        let max = self.call.context.max_response_size;
        let conn = session
            .conn
            .as_mut()
            .ok_or(Error::IllegalState("interactor has no connection"))?;
        let (decoder, section) = read_buffered(conn.reader(), max)?;
        let (index, data_len) = self.call.peek_id(&decoder, &section, &session.answered)?;
        let payload = match data_len {
            Some(len) if len > max as u64 => {
                return Err(Error::protocol(format!(
                    "payload of {} bytes exceeds limit {}",
                    len, max
                )))
            }
            Some(len) => {
                let mut raw = vec![0u8; len as usize];
                conn.reader().read_exact(&mut raw)?;
                Bytes::from(raw)
            }
            None => Bytes::new(),
        };
        session.answered[index] = true;
        let body = ResponseBody::buffered(decoder, section, payload, &self.call.log);
        Ok(Response::new(self.call.endpoint.clone(), Some(index), body))
    }

    fn read_streaming(&self, session: &mut Session) -> Result<Response> {
        let max = self.call.context.max_response_size;
        let conn = session
            .conn
            .as_mut()
            .ok_or(Error::IllegalState("interactor has no connection"))?;
        let mut decoder = ValueDecoder::read_header(conn.reader(), max)?;
        let values = decoder.decode(conn.reader())?;
        let index = match values.get(ID_PARAM).and_then(|id| id.as_u64()) {
            Some(id) => id as usize,
            None => return Err(Error::protocol("response has no numeric id")),
        };
        if session.answered.get(index) != Some(&false) {
            return Err(Error::protocol(format!(
                "response id {} matches no outstanding request",
                index
            )));
        }
        session.answered[index] = true;

        let conn = session
            .conn
            .take()
            .ok_or(Error::IllegalState("interactor has no connection"))?;
        self.call.execution.untrack();
        let body = ResponseBody::streaming_decoded(
            conn,
            Arc::clone(&self.call.context.provider),
            decoder,
            values,
            &self.call.log,
        );
        Ok(Response::new(self.call.endpoint.clone(), Some(index), body))
    }

    fn fail(&self, session: &mut Session, err: Error) -> Error {
        session.failed = true;
        self.call.execution.untrack();
        if let Some(conn) = session.conn.take() {
            debug!(self.call.log, "interactor failed"; "connection" => conn.id(), "error" => %err);
            self.call.context.provider.discard(conn);
        }
        self.call.execution.failure(err)
    }
}

impl Drop for Interactor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::tests::context;
    use crate::call::CallContext;
    use crate::endpoint::Endpoint;
    use crate::multicall::MultiCall;
    use crate::request::Request;
    use crate::testing::{MockConnector, MockTransport};
    use serde_json::json;

    struct Fixture {
        mc: MultiCall,
        ctx: Arc<CallContext>,
    }

    impl Fixture {
        fn idle(&self) -> usize {
            self.ctx.provider.pool().idle_count()
        }
    }

    fn start(connector: &MockConnector, n: usize) -> (Fixture, Interactor) {
        let requests = (0..n).map(|i| Request::builder("get").param("i", i).build()).collect();
        let ctx = context(connector);
        let mc = MultiCall::new(requests, Endpoint::new("mock", 1), Arc::clone(&ctx));
        let interactor = mc.start().unwrap();
        (Fixture { mc, ctx }, interactor)
    }

    fn answer(transport: &MockTransport, ids: &[u64]) {
        for id in ids {
            transport.push_response(&json!({"id": id}), None);
        }
    }

    #[test]
    fn next_response_before_submit_is_illegal() {
        let connector = MockConnector::new();
        let (_mc, interactor) = start(&connector, 2);
        assert!(!interactor.has_next_response());
        assert!(matches!(interactor.next_response(), Err(Error::IllegalState(_))));
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn pipelines_and_recycles_when_fully_read() {
        let connector = MockConnector::new();
        let transport = connector.add();
        answer(&transport, &[0, 1, 2]);
        let (s, interactor) = start(&connector, 3);

        assert_eq!(interactor.submit_requests(2).unwrap(), 2);
        assert_eq!(interactor.remaining_requests(), 1);
        let mut first = interactor.next_response().unwrap();
        assert_eq!(first.index(), Some(0));
        first.values().unwrap();
        assert!(interactor.has_next_response());

        assert_eq!(interactor.submit_requests(10).unwrap(), 1);
        assert_eq!(interactor.submit_requests(10).unwrap(), 0);
        interactor.next_response().unwrap().values().unwrap();
        let last = interactor.next_response().unwrap();
        assert_eq!(last.index(), Some(2));
        assert!(!interactor.has_next_response());
        assert_eq!(interactor.handled_responses(), 3);

        // the last response carries the connection
        assert_eq!(s.idle(), 0);
        drop(last);
        assert_eq!(s.idle(), 1);
        interactor.close();
        assert_eq!(s.idle(), 1);
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn undrained_previous_response_blocks_next() {
        let connector = MockConnector::new();
        let transport = connector.add();
        answer(&transport, &[1, 0]);
        let (_mc, interactor) = start(&connector, 3);
        interactor.submit_requests(3).unwrap();

        let mut first = interactor.next_response().unwrap();
        assert_eq!(first.index(), Some(1));
        assert!(matches!(interactor.next_response(), Err(Error::IllegalState(_))));
        first.values().unwrap();
        assert_eq!(interactor.next_response().unwrap().index(), Some(0));
    }

    #[test]
    fn closing_with_unread_response_discards() {
        let connector = MockConnector::new();
        let transport = connector.add();
        answer(&transport, &[0, 1]);
        let (s, interactor) = start(&connector, 3);
        interactor.submit_requests(2).unwrap();
        interactor.next_response().unwrap().close();
        assert!(interactor.has_next_response());

        interactor.close();
        assert_eq!(transport.shutdown_count(), 1);
        assert_eq!(s.idle(), 0);
        assert!(matches!(interactor.submit_requests(1), Err(Error::IllegalState(_))));
        assert!(matches!(interactor.next_response(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn closing_after_reading_everything_written_recycles() {
        let connector = MockConnector::new();
        let transport = connector.add();
        answer(&transport, &[0]);
        let (s, interactor) = start(&connector, 3);
        interactor.submit_requests(1).unwrap();
        interactor.next_response().unwrap().close();
        drop(interactor);
        assert_eq!(transport.shutdown_count(), 0);
        assert_eq!(s.idle(), 1);
    }

    #[test]
    fn buffers_payload_of_earlier_responses() {
        let connector = MockConnector::new();
        let transport = connector.add();
        transport.push_response(&json!({"id": 0}), Some(b"payload"));
        answer(&transport, &[1]);
        let (_mc, interactor) = start(&connector, 2);
        interactor.submit_requests(2).unwrap();

        let mut first = interactor.next_response().unwrap();
        assert_eq!(first.body().data_to_vec().unwrap(), b"payload");
        assert_eq!(interactor.next_response().unwrap().index(), Some(1));
    }

    #[test]
    fn cancel_stops_the_session() {
        let connector = MockConnector::new();
        let transport = connector.add();
        let (s, interactor) = start(&connector, 2);
        interactor.submit_requests(1).unwrap();
        s.mc.cancel();
        assert_eq!(transport.shutdown_count(), 1);
        assert!(matches!(interactor.next_response(), Err(Error::Cancelled)));
    }
}
