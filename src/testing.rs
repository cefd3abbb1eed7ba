// Copyright 2020 Joyent, Inc.

//! In-memory transport and connector doubles for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use slog::{o, Logger};

use crate::connection::{Connector, ShutdownHandle, Transport};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::encode_response;

#[derive(Default)]
struct MockState {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    peer_closed: bool,
    shutdown: bool,
    shutdowns: usize,
    read_timeout: Option<Duration>,
}

/// Scripted transport. Reads drain bytes pushed with `push_incoming`; when
/// none are left a read reports `WouldBlock`, or end of stream once the
/// peer is closed. Writes are captured.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state.lock().unwrap().incoming.extend(bytes.iter().copied());
    }

    /// Queues an encoded response, optionally followed by payload bytes.
    pub fn push_response(&self, value: &Value, data: Option<&[u8]>) {
        let encoded = encode_response(value, data.map(|d| d.len() as u64)).unwrap();
        self.push_incoming(&encoded);
        if let Some(data) = data {
            self.push_incoming(data);
        }
    }

    pub fn close_peer(&self) {
        self.state.lock().unwrap().peer_closed = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().outgoing.clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.lock().unwrap().shutdowns
    }

    pub fn unread(&self) -> usize {
        self.state.lock().unwrap().incoming.len()
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "shut down"));
        }
        if state.incoming.is_empty() {
            if state.peer_closed {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shut down"));
        }
        state.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.state.lock().unwrap().read_timeout = timeout;
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        Ok(self.state.lock().unwrap().read_timeout)
    }

    fn shutdown_handle(&self) -> io::Result<Box<dyn ShutdownHandle>> {
        Ok(Box::new(self.clone()))
    }
}

impl ShutdownHandle for MockTransport {
    fn shutdown(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.shutdowns += 1;
        Ok(())
    }
}

/// Hands out queued transports in order and counts connects.
#[derive(Clone, Default)]
pub struct MockConnector {
    transports: Arc<Mutex<VecDeque<MockTransport>>>,
    connects: Arc<Mutex<usize>>,
}

impl MockConnector {
    pub fn new() -> MockConnector {
        MockConnector::default()
    }

    /// Queues a fresh transport and returns it for scripting.
    pub fn add(&self) -> MockTransport {
        let transport = MockTransport::new();
        self.transports.lock().unwrap().push_back(transport.clone());
        transport
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint, _timeout: Option<Duration>) -> Result<Box<dyn Transport>> {
        *self.connects.lock().unwrap() += 1;
        match self.transports.lock().unwrap().pop_front() {
            Some(t) => Ok(Box::new(t)),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no mock transport left for {}", endpoint),
            ))),
        }
    }
}

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
