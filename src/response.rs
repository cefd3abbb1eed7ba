// Copyright 2020 Joyent, Inc.

//! Responses and their bodies.
//!
//! A streaming [`ResponseBody`] owns the connection it is read from. The
//! connection goes back to the pool when the body is closed or dropped,
//! but only if the value section was decoded to its end and any binary
//! payload was read to its last byte. Anything else leaves the stream at
//! an unknown position, so the connection is closed instead.

use std::cmp;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use slog::{debug, Logger};

use crate::connection::Connection;
use crate::decode::ValueDecoder;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::provider::ConnectionProvider;

enum Source {
    Buffered {
        section: Cursor<Bytes>,
        payload: Cursor<Bytes>,
    },
    Streaming {
        conn: Connection,
        provider: Arc<ConnectionProvider>,
    },
    Released,
}

/// The value section and optional payload of one response.
pub struct ResponseBody {
    decoder: ValueDecoder,
    values: Option<Value>,
    source: Source,
    payload_left: u64,
    failed: bool,
    finished: Arc<AtomicBool>,
    log: Logger,
}

impl ResponseBody {
    /// A body read straight off `conn`, whose length prefix was already
    /// consumed into `decoder`.
    pub(crate) fn streaming(
        conn: Connection,
        provider: Arc<ConnectionProvider>,
        decoder: ValueDecoder,
        log: &Logger,
    ) -> ResponseBody {
        ResponseBody::new(decoder, None, Source::Streaming { conn, provider }, log)
    }

    /// A streaming body whose values were already decoded off `conn`. Only
    /// the payload, if any, is left on the stream.
    pub(crate) fn streaming_decoded(
        conn: Connection,
        provider: Arc<ConnectionProvider>,
        decoder: ValueDecoder,
        values: Value,
        log: &Logger,
    ) -> ResponseBody {
        ResponseBody::new(decoder, Some(values), Source::Streaming { conn, provider }, log)
    }

    /// A body held entirely in memory. Closing it never touches a
    /// connection.
    pub(crate) fn buffered(
        decoder: ValueDecoder,
        section: Cursor<Bytes>,
        payload: Bytes,
        log: &Logger,
    ) -> ResponseBody {
        let source = Source::Buffered {
            section,
            payload: Cursor::new(payload),
        };
        ResponseBody::new(decoder, None, source, log)
    }

    fn new(
        decoder: ValueDecoder,
        values: Option<Value>,
        source: Source,
        log: &Logger,
    ) -> ResponseBody {
        let payload_left = match values {
            Some(_) => decoder.data_len().unwrap_or(0),
            None => 0,
        };
        let body = ResponseBody {
            decoder,
            values,
            source,
            payload_left,
            failed: false,
            finished: Arc::new(AtomicBool::new(false)),
            log: log.clone(),
        };
        body.update_finished();
        body
    }

    /// The decoded top-level object, decoding it on first use.
    pub fn values(&mut self) -> Result<&Value> {
        self.ensure_values()?;
        self.values
            .as_ref()
            .ok_or(Error::IllegalState("response values unavailable"))
    }

    /// Decodes the values and closes the body. A payload left unread is
    /// skipped by closing the connection.
    pub fn into_values(mut self) -> Result<Value> {
        self.ensure_values()?;
        // release while the values are still held so a drained body recycles
        self.release();
        self.values
            .take()
            .ok_or(Error::IllegalState("response values unavailable"))
    }

    /// Deserializes the decoded values into `T`.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let values = self.values()?;
        Ok(T::deserialize(values)?)
    }

    /// Length of the binary payload, if the response announced one.
    pub fn data_len(&mut self) -> Result<Option<u64>> {
        self.ensure_values()?;
        Ok(self.decoder.data_len())
    }

    /// Reader over the binary payload. Decodes the values first if that
    /// has not happened yet.
    pub fn data(&mut self) -> Result<DataReader<'_>> {
        if self.data_len()?.is_none() {
            return Err(Error::IllegalState("response carries no data"));
        }
        Ok(DataReader { body: self })
    }

    /// Reads the whole payload into memory. Empty if there is none.
    pub fn data_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if self.data_len()?.is_some() {
            self.data()?.read_to_end(&mut out)?;
        }
        Ok(out)
    }

    /// Payload bytes not read yet.
    pub fn remaining_data(&self) -> u64 {
        self.payload_left
    }

    /// True once the values were decoded and the payload fully read.
    pub fn is_drained(&self) -> bool {
        !self.failed && self.values.is_some() && self.payload_left == 0
    }

    /// Releases the body, returning its connection to the pool when the
    /// body was drained and closing it otherwise.
    pub fn close(mut self) {
        self.release();
    }

    /// Set once the body is drained or released.
    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    fn ensure_values(&mut self) -> Result<()> {
        if self.values.is_some() {
            return Ok(());
        }
        if self.failed {
            return Err(Error::IllegalState("response body failed"));
        }
        let decoded = match &mut self.source {
            Source::Buffered { section, .. } => self.decoder.decode(section),
            Source::Streaming { conn, .. } => self.decoder.decode(conn.reader()),
            Source::Released => return Err(Error::IllegalState("response body is closed")),
        };
        match decoded {
            Ok(values) => {
                self.payload_left = self.decoder.data_len().unwrap_or(0);
                self.values = Some(values);
                self.update_finished();
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    fn update_finished(&self) {
        if self.is_drained() {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.release();
    }

    fn release(&mut self) {
        let clean = self.is_drained();
        if let Source::Streaming { conn, provider } = mem::replace(&mut self.source, Source::Released)
        {
            if clean {
                provider.recycle(conn);
            } else {
                debug!(self.log, "closing connection of undrained response";
                    "connection" => conn.id(),
                    "values_decoded" => self.values.is_some(),
                    "payload_left" => self.payload_left);
                provider.discard(conn);
            }
        }
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Buffered { .. } => "buffered",
            Source::Streaming { .. } => "streaming",
            Source::Released => "released",
        };
        f.debug_struct("ResponseBody")
            .field("source", &source)
            .field("values", &self.values)
            .field("data_len", &self.decoder.data_len())
            .field("payload_left", &self.payload_left)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Reads a response payload, stopping at its declared length.
pub struct DataReader<'a> {
    body: &'a mut ResponseBody,
}

impl Read for DataReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let body = &mut *self.body;
        if body.payload_left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = cmp::min(buf.len() as u64, body.payload_left) as usize;
        let res = match &mut body.source {
            Source::Buffered { payload, .. } => payload.read(&mut buf[..want]),
            Source::Streaming { conn, .. } => conn.reader().read(&mut buf[..want]),
            Source::Released => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response body is closed",
            )),
        };
        match res {
            Ok(0) => {
                let left = body.payload_left;
                body.fail();
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("payload ended with {} bytes missing", left),
                ))
            }
            Ok(n) => {
                body.payload_left -= n as u64;
                body.update_finished();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                body.fail();
                Err(e)
            }
        }
    }
}

/// One decoded response.
#[derive(Debug)]
pub struct Response {
    endpoint: Endpoint,
    index: Option<usize>,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(endpoint: Endpoint, index: Option<usize>, body: ResponseBody) -> Response {
        Response {
            endpoint,
            index,
            body,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Position of the answered request within its multi-call.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn body(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub fn values(&mut self) -> Result<&Value> {
        self.body.values()
    }

    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.body.json()
    }

    pub fn close(self) {
        self.body.close()
    }

    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        self.body.finished_flag()
    }
}
