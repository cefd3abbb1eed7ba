// Copyright 2020 Joyent, Inc.

//! Request values.
//!
//! A [`Request`] is immutable once built: the method name, an optional
//! endpoint override, the ordered parameter list and an optional binary
//! payload. The payload is held as a [`RequestData`] source that can be
//! opened once per send, so the same request can be executed again.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// A single request parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Str(String),
    UInt(u64),
    /// Signed integer. Negative values travel as their decimal string since
    /// the wire format has no signed number type.
    Int(i64),
    Bool(bool),
}

impl From<&str> for Param {
    fn from(v: &str) -> Param {
        Param::Str(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Param {
        Param::Str(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Param {
        Param::Bool(v)
    }
}

macro_rules! unsigned_param {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Param {
                Param::UInt(v as u64)
            }
        })*
    };
}

macro_rules! signed_param {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Param {
                Param::Int(v as i64)
            }
        })*
    };
}

unsigned_param!(u8, u16, u32, u64, usize);
signed_param!(i8, i16, i32, i64, isize);

impl Param {
    /// The JSON value a server would see after decoding this parameter.
    pub fn to_json(&self) -> Value {
        match self {
            Param::Str(s) => Value::from(s.as_str()),
            Param::UInt(n) => Value::from(*n),
            Param::Int(n) if *n < 0 => Value::from(n.to_string()),
            Param::Int(n) => Value::from(*n as u64),
            Param::Bool(b) => Value::from(*b),
        }
    }

    fn from_json(name: &str, value: Value) -> Result<Param> {
        match value {
            Value::String(s) => Ok(Param::Str(s)),
            Value::Bool(b) => Ok(Param::Bool(b)),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Ok(Param::UInt(u))
                } else if let Some(i) = n.as_i64() {
                    Ok(Param::Int(i))
                } else {
                    Ok(Param::Str(n.to_string()))
                }
            }
            other => Err(Error::InvalidParameter(format!(
                "field {} has unsupported type: {}",
                name, other
            ))),
        }
    }
}

/// Source of a request's binary payload.
///
/// `len` must match the number of bytes `open` yields; the encoder
/// declares it on the wire before streaming the bytes.
pub trait RequestData: Send + Sync {
    fn len(&self) -> u64;

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;
}

impl RequestData for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(io::Cursor::new(self.as_ref())))
    }
}

impl RequestData for Vec<u8> {
    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(io::Cursor::new(self.as_slice())))
    }
}

#[derive(Clone)]
pub struct Request {
    method: String,
    endpoint: Option<Endpoint>,
    params: Vec<(String, Param)>,
    data: Option<Arc<dyn RequestData>>,
}

impl Request {
    /// A request with no parameters.
    pub fn new<S: Into<String>>(method: S) -> Request {
        Request::builder(method).build()
    }

    pub fn builder<S: Into<String>>(method: S) -> RequestBuilder {
        RequestBuilder {
            request: Request {
                method: method.into(),
                endpoint: None,
                params: Vec::new(),
                data: None,
            },
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn params(&self) -> &[(String, Param)] {
        &self.params
    }

    pub fn data(&self) -> Option<&dyn RequestData> {
        self.data.as_deref()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("params", &self.params)
            .field("data_len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Appends a parameter. Order is preserved on the wire.
    pub fn param<S, P>(mut self, name: S, value: P) -> RequestBuilder
    where
        S: Into<String>,
        P: Into<Param>,
    {
        self.request.params.push((name.into(), value.into()));
        self
    }

    /// Appends one parameter per field of a serializable struct or map.
    /// Fields must be strings, integers or booleans.
    pub fn params_from<T: Serialize>(mut self, value: &T) -> Result<RequestBuilder> {
        match serde_json::to_value(value)? {
            Value::Object(map) => {
                for (name, v) in map {
                    let param = Param::from_json(&name, v)?;
                    self.request.params.push((name, param));
                }
                Ok(self)
            }
            other => Err(Error::InvalidParameter(format!(
                "parameters must serialize to an object, got {}",
                other
            ))),
        }
    }

    /// Sends this request to `endpoint` instead of the client default.
    pub fn endpoint(mut self, endpoint: Endpoint) -> RequestBuilder {
        self.request.endpoint = Some(endpoint);
        self
    }

    pub fn data<D: RequestData + 'static>(mut self, data: D) -> RequestBuilder {
        self.request.data = Some(Arc::new(data));
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Serialize;

    #[derive(Serialize)]
    struct PutObject {
        bucket: String,
        size: u64,
        offset: i32,
        overwrite: bool,
    }

    #[test]
    fn builds_params_in_order() {
        let req = Request::builder("getobject")
            .param("bucket", "photos")
            .param("limit", 10u32)
            .param("delta", -3)
            .param("recursive", true)
            .build();
        assert_eq!(req.method(), "getobject");
        assert_eq!(
            req.params(),
            &[
                ("bucket".to_string(), Param::Str("photos".to_string())),
                ("limit".to_string(), Param::UInt(10)),
                ("delta".to_string(), Param::Int(-3)),
                ("recursive".to_string(), Param::Bool(true)),
            ][..]
        );
    }

    #[test]
    fn maps_struct_fields_to_params() {
        let payload = PutObject {
            bucket: "photos".to_string(),
            size: 4096,
            offset: -1,
            overwrite: false,
        };
        let req = Request::builder("putobject")
            .params_from(&payload)
            .unwrap()
            .build();
        let params: Vec<_> = req.params().iter().map(|(n, _)| n.as_str()).collect();
        assert!(params.contains(&"bucket"));
        assert!(req
            .params()
            .iter()
            .any(|(n, p)| n == "offset" && *p == Param::Int(-1)));
    }

    #[test]
    fn rejects_nested_fields() {
        let nested = serde_json::json!({"inner": {"a": 1}});
        assert!(Request::builder("m").params_from(&nested).is_err());
        assert!(Request::builder("m").params_from(&vec![1, 2]).is_err());
    }

    #[test]
    fn negative_ints_are_seen_as_strings() {
        assert_eq!(Param::Int(-42).to_json(), Value::from("-42"));
        assert_eq!(Param::Int(42).to_json(), Value::from(42u64));
    }

    #[test]
    fn payload_source_reopens() {
        let req = Request::builder("upload").data(vec![1u8, 2, 3]).build();
        let data = req.data().unwrap();
        assert_eq!(data.len(), 3);
        for _ in 0..2 {
            let mut buf = Vec::new();
            data.open().unwrap().read_to_end(&mut buf).unwrap();
            assert_eq!(buf, vec![1, 2, 3]);
        }
    }
}
