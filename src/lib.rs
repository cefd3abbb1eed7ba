// Copyright 2020 Joyent, Inc.

//! binrpc: a blocking client for a compact binary RPC protocol over TLS
//!
//! A client sends a request naming a method, a list of typed parameters and
//! optionally a binary payload. The server answers with one self-describing
//! value, also optionally followed by a binary payload. Sockets are pooled
//! and reused across calls; a socket is only reused when the previous
//! exchange left its byte stream exactly at a response boundary.
//!
//! Request format
//!
//! * SIZE          2-byte little-endian integer, the number of bytes of the
//!                 section that follows, payload excluded (at most 65,535).
//!
//! * NAMELEN       1 byte. The low 7 bits are the length of the UTF-8 method
//!                 name (at most 127). Bit 7 is set when a payload follows.
//!
//! * NAME          The method name.
//!
//! * DATALEN       8-byte little-endian payload length, present only when
//!                 bit 7 of NAMELEN is set.
//!
//! * PARAMCOUNT    1-byte parameter count (at most 255).
//!
//! * PARAMS        Per parameter, one header byte: bits 0-5 are the name
//!                 length (at most 63), bits 6-7 the type (0 string, 1
//!                 number, 2 boolean). Then the name, then the value: a
//!                 string is a 4-byte little-endian length and UTF-8 bytes, a
//!                 number is 8 bytes little-endian, a boolean is one byte.
//!                 Negative numbers travel as their decimal string.
//!
//! * DATA          DATALEN raw bytes, streamed from the request's source.
//!
//! Response format
//!
//! A 4-byte little-endian length of the value section, then one value,
//! which must be an object. Each value starts with a tag byte:
//!
//! * 0-3       string, with a (tag + 1)-byte length
//! * 4-7       reference to a previously seen string, (tag - 3)-byte index
//! * 8-15      unsigned integer of (tag - 7) bytes
//! * 16        object: key/value pairs until a terminator
//! * 17        array: values until a terminator
//! * 18, 19    false, true
//! * 20        data marker: 8-byte payload length; decodes to null
//! * 100-149   string of length (tag - 100)
//! * 150-199   reference to string (tag - 150)
//! * 200-219   small integer (tag - 200)
//! * 255       terminator
//!
//! Every literal string, object keys included, is appended to a per-response
//! cache in decode order; reference tags index into it. A response carries
//! at most one data marker, and its payload bytes follow the value section.
//!
//! Batches: every request of a multi-call carries an extra `id` parameter,
//! its index within the batch, and the server echoes it as the `id` field of
//! the response. Responses may come back in any order.

#![allow(missing_docs)]

pub mod call;
pub mod client;
pub mod connection;
pub mod decode;
mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod interactor;
pub mod multicall;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod request;
pub mod response;

#[cfg(test)]
mod testing;

pub use crate::call::Call;
pub use crate::client::{Client, ClientBuilder, ClientConfig, RemoteMethod};
pub use crate::connection::{Connection, Connector, PlainConnector, TlsConnector, Transport};
pub use crate::endpoint::Endpoint;
pub use crate::error::{Error, Result};
pub use crate::interactor::Interactor;
pub use crate::multicall::{BatchError, MultiCall, MultiCallback, MultiResponse};
pub use crate::pool::ConnectionPool;
pub use crate::request::{Param, Request, RequestBuilder, RequestData};
pub use crate::response::{DataReader, Response, ResponseBody};
