// Copyright 2020 Joyent, Inc.

//! Batches of requests over one connection.
//!
//! Every request of a [`MultiCall`] carries a synthetic `id` parameter,
//! its index in the batch, appended after its own parameters. The server
//! may answer in any order; responses are matched back to their requests
//! by the `id` field of each response. Batch responses are read into
//! memory whole, so none of them may carry a binary payload.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use slog::{debug, o, Logger};
use thiserror::Error;

use crate::call::{CallContext, Execution};
use crate::connection::Connection;
use crate::decode::{read_buffered, ValueDecoder};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::interactor::Interactor;
use crate::protocol::{self, ID_PARAM};
use crate::request::Request;
use crate::response::{Response, ResponseBody};

/// A failed batch. `completed` holds, at each request's index, the
/// response decoded before the failure, if any.
#[derive(Debug, Error)]
#[error("multi-call failed")]
pub struct BatchError {
    #[source]
    pub error: Error,
    pub completed: Vec<Option<Response>>,
}

impl BatchError {
    fn bare(error: Error) -> BatchError {
        BatchError {
            error,
            completed: Vec::new(),
        }
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

impl From<BatchError> for Error {
    fn from(batch: BatchError) -> Error {
        batch.error
    }
}

/// Receives the outcome of an enqueued batch on a worker thread.
///
/// `on_response` sees responses in the order the server sent them, each
/// with the index of its request. After a failure no further responses
/// are delivered and `on_complete` is not called.
pub trait MultiCallback: Send + 'static {
    fn on_response(&mut self, index: usize, response: Response);

    fn on_failure(&mut self, error: Error);

    fn on_complete(&mut self) {}
}

/// Responses of a successful batch, in request order.
#[derive(Debug, Default)]
pub struct MultiResponse {
    responses: Vec<Response>,
}

impl MultiResponse {
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Response> {
        self.responses.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Response> {
        self.responses.get_mut(index)
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Response> {
        self.responses.iter_mut()
    }

    pub fn into_vec(self) -> Vec<Response> {
        self.responses
    }
}

impl IntoIterator for MultiResponse {
    type Item = Response;
    type IntoIter = std::vec::IntoIter<Response>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.into_iter()
    }
}

pub(crate) struct MultiCallInner {
    pub(crate) requests: Vec<Request>,
    pub(crate) endpoint: Endpoint,
    pub(crate) context: Arc<CallContext>,
    pub(crate) execution: Execution,
    pub(crate) log: Logger,
}

/// A batch of requests sent to one endpoint over one connection.
#[derive(Clone)]
pub struct MultiCall {
    inner: Arc<MultiCallInner>,
}

impl MultiCall {
    pub(crate) fn new(
        requests: Vec<Request>,
        endpoint: Endpoint,
        context: Arc<CallContext>,
    ) -> MultiCall {
        let log = context.log.new(o!(
            "endpoint" => endpoint.to_string(),
            "batch_size" => requests.len()
        ));
        MultiCall {
            inner: Arc::new(MultiCallInner {
                requests,
                endpoint,
                context,
                execution: Execution::new(),
                log,
            }),
        }
    }

    pub fn requests(&self) -> &[Request] {
        &self.inner.requests
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Writes every request, then reads every response. On failure the
    /// responses decoded so far come back inside the error.
    pub fn execute(&self) -> std::result::Result<MultiResponse, BatchError> {
        self.inner.execution.start().map_err(BatchError::bare)?;
        self.inner.run()
    }

    /// Runs the batch on a worker thread, reporting to `callback`.
    pub fn enqueue<C: MultiCallback>(&self, mut callback: C) -> Result<()> {
        self.inner.execution.start()?;
        let inner = Arc::clone(&self.inner);
        self.inner.context.dispatcher.spawn(move || {
            let mut delivered = |index, response| callback.on_response(index, response);
            match inner.run_with(&mut delivered) {
                Ok(()) => callback.on_complete(),
                Err(e) => callback.on_failure(e),
            }
        })
    }

    /// Hands the batch to an [`Interactor`], which writes requests and
    /// reads responses as its caller asks for them.
    pub fn start(&self) -> Result<Interactor> {
        self.inner.execution.start()?;
        let frames = self.inner.encode()?;
        Ok(Interactor::new(Arc::clone(&self.inner), frames))
    }

    pub fn cancel(&self) {
        self.inner.execution.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.execution.is_cancelled()
    }
}

impl fmt::Debug for MultiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCall")
            .field("endpoint", &self.inner.endpoint)
            .field("requests", &self.inner.requests.len())
            .field("executed", &self.inner.execution.is_executed())
            .finish()
    }
}

impl MultiCallInner {
    /// Encodes every request with its id. Size limits fail here, before
    /// any connection is used.
    pub(crate) fn encode(&self) -> Result<Vec<BytesMut>> {
        self.requests
            .iter()
            .enumerate()
            .map(|(id, request)| {
                let mut frame = BytesMut::new();
                protocol::encode_request(request, Some(id as u64), &mut frame)?;
                Ok(frame)
            })
            .collect()
    }

    fn run(&self) -> std::result::Result<MultiResponse, BatchError> {
        let mut slots: Vec<Option<Response>> = self.requests.iter().map(|_| None).collect();
        let outcome = self.run_with(&mut |index, response| slots[index] = Some(response));
        if let Err(error) = outcome {
            return Err(BatchError {
                error,
                completed: slots,
            });
        }
        match slots.into_iter().collect::<Option<Vec<Response>>>() {
            Some(responses) => Ok(MultiResponse { responses }),
            None => Err(BatchError::bare(Error::protocol("batch ended with unanswered requests"))),
        }
    }

    fn run_with(&self, deliver: &mut dyn FnMut(usize, Response)) -> Result<()> {
        if self.execution.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.requests.is_empty() {
            return Ok(());
        }
        let frames = self.encode()?;

        let provider = &self.context.provider;
        let mut conn = provider.obtain(&self.endpoint)?;
        if !self.execution.track(&conn) {
            provider.discard(conn);
            return Err(Error::Cancelled);
        }

        let exchanged = self.exchange(&mut conn, &frames, deliver);
        self.execution.untrack();
        match exchanged {
            Ok(()) if !self.execution.is_cancelled() => {
                provider.recycle(conn);
                Ok(())
            }
            Ok(()) => {
                provider.discard(conn);
                Err(Error::Cancelled)
            }
            Err(e) => {
                debug!(self.log, "multi-call failed"; "connection" => conn.id(), "error" => %e);
                provider.discard(conn);
                Err(self.execution.failure(e))
            }
        }
    }

    fn exchange(
        &self,
        conn: &mut Connection,
        frames: &[BytesMut],
        deliver: &mut dyn FnMut(usize, Response),
    ) -> Result<()> {
        for (request, frame) in self.requests.iter().zip(frames) {
            protocol::write_request(request, frame, conn.writer())?;
        }
        debug!(self.log, "sent batch"; "connection" => conn.id());

        let mut answered = vec![false; self.requests.len()];
        for _ in 0..self.requests.len() {
            let (decoder, section) = read_buffered(conn.reader(), self.context.max_response_size)?;
            let (index, data_len) = self.peek_id(&decoder, &section, &answered)?;
            if data_len.is_some() {
                return Err(Error::protocol(format!(
                    "response {} to a multi-call carries data",
                    index
                )));
            }
            answered[index] = true;
            let body = ResponseBody::buffered(decoder, section, Bytes::new(), &self.log);
            deliver(index, Response::new(self.endpoint.clone(), Some(index), body));
        }
        Ok(())
    }

    /// Looks ahead in a buffered response for its `id`. The id must name a
    /// request in `answered` that has no response yet.
    pub(crate) fn peek_id(
        &self,
        decoder: &ValueDecoder,
        section: &Cursor<Bytes>,
        answered: &[bool],
    ) -> Result<(usize, Option<u64>)> {
        let (values, data_len) = decoder.peek(section)?;
        let index = match values.get(ID_PARAM) {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| Error::protocol(format!("response id {} is not an index", n)))?
                as usize,
            Some(other) => {
                return Err(Error::protocol(format!("response id {} is not a number", other)))
            }
            None => return Err(Error::protocol("response has no id")),
        };
        match answered.get(index) {
            None => Err(Error::protocol(format!(
                "response id {} matches no request",
                index
            ))),
            Some(true) => Err(Error::protocol(format!(
                "second response for id {}",
                index
            ))),
            Some(false) => Ok((index, data_len)),
        }
    }
}
