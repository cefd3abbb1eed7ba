// Copyright 2020 Joyent, Inc.

//! Error type shared by the codec, the connection layer and the call engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket level failure: connect, read, write, timeout or peer reset.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup failure, including certificate and hostname verification.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The request does not fit the wire format. Raised before any bytes
    /// are sent.
    #[error("request exceeds protocol limit: {0}")]
    SizeLimit(String),

    /// The peer sent bytes that violate the response format.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The API was driven out of order (double execute, reading before
    /// submitting, using a closed interactor).
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no endpoint configured for method {0}")]
    NoEndpoint(String),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn protocol<S: Into<String>>(msg: S) -> Error {
        Error::Protocol(msg.into())
    }

    pub(crate) fn size_limit<S: Into<String>>(msg: S) -> Error {
        Error::SizeLimit(msg.into())
    }

    /// True for failures that happened on the wire (socket, TLS, protocol,
    /// cancellation, timeout). The connection involved is never reused
    /// after one of these.
    pub fn is_io_failure(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Tls(_)
            | Error::Protocol(_)
            | Error::Cancelled
            | Error::Timeout(_) => true,
            _ => false,
        }
    }
}
