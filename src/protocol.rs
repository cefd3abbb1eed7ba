// Copyright 2020 Joyent, Inc.

//! Request encoding and the wire constants shared with [`crate::decode`].
//!
//! The server half of the codec (`decode_request`, `encode_response`) lives
//! here as well so test doubles and servers speak exactly the same format.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::request::{Param, Request};

pub const MAX_METHOD_NAME_LEN: usize = 0x7f;
pub const MAX_PARAM_NAME_LEN: usize = 0x3f;
pub const MAX_PARAM_COUNT: usize = 0xff;
pub const MAX_REQUEST_SIZE: usize = 0xffff;

/// Name of the parameter a multi-call appends to each of its requests.
pub const ID_PARAM: &str = "id";

/// Key under which `encode_response` places the data marker.
pub const DATA_FIELD: &str = "data";

const RQ_DATA_FLAG: u8 = 0x80;
const RQ_NAME_LEN_MASK: u8 = 0x7f;
const RQ_PARAM_TYPE_SHIFT: u8 = 6;
const RQ_PARAM_NAME_MASK: u8 = 0x3f;

/// Response value tags.
pub mod tag {
    pub const STRING: u8 = 0;
    pub const STRING_LAST: u8 = 3;
    pub const CACHED: u8 = 4;
    pub const CACHED_LAST: u8 = 7;
    pub const INT: u8 = 8;
    pub const INT_LAST: u8 = 15;
    pub const OBJECT: u8 = 16;
    pub const ARRAY: u8 = 17;
    pub const FALSE: u8 = 18;
    pub const TRUE: u8 = 19;
    pub const DATA: u8 = 20;
    pub const SHORT_STRING: u8 = 100;
    pub const SHORT_STRING_LAST: u8 = 149;
    pub const SHORT_CACHED: u8 = 150;
    pub const SHORT_CACHED_LAST: u8 = 199;
    pub const SMALL_INT: u8 = 200;
    pub const SMALL_INT_LAST: u8 = 219;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ParamType {
    String = 0,
    Number = 1,
    Boolean = 2,
}

/// A request as seen by a server after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub method: String,
    pub params: Vec<(String, Param)>,
    pub data_len: Option<u64>,
}

impl RequestFrame {
    pub fn param(&self, name: &str) -> Option<&Param> {
        // Last occurrence wins, which is what keeps an injected id from
        // being shadowed.
        self.params.iter().rev().find(|(n, _)| n == name).map(|(_, p)| p)
    }
}

/// Encodes `request` into `buf` as one complete frame, without the payload
/// bytes. `id` is appended as the final parameter when present.
///
/// Every size limit is checked here, so a request that does not fit fails
/// before a connection is touched.
pub fn encode_request(
    request: &Request,
    id: Option<u64>,
    buf: &mut BytesMut,
) -> Result<usize> {
    let method = request.method().as_bytes();
    if method.len() > MAX_METHOD_NAME_LEN {
        return Err(Error::size_limit(format!(
            "method name is {} bytes, limit is {}",
            method.len(),
            MAX_METHOD_NAME_LEN
        )));
    }

    let param_count = request.params().len() + id.map_or(0, |_| 1);
    if param_count > MAX_PARAM_COUNT {
        return Err(Error::size_limit(format!(
            "{} parameters, limit is {}",
            param_count, MAX_PARAM_COUNT
        )));
    }

    // The section is built in a scratch buffer first since its size
    // prefixes it on the wire.
    let mut section = BytesMut::with_capacity(256);
    let data_len = request.data().map(|d| d.len());
    let flag = if data_len.is_some() { RQ_DATA_FLAG } else { 0 };
    section.put_u8(method.len() as u8 | flag);
    section.put_slice(method);
    if let Some(len) = data_len {
        section.put_u64_le(len);
    }
    section.put_u8(param_count as u8);

    for (name, param) in request.params() {
        encode_param(name, param, &mut section)?;
    }
    if let Some(id) = id {
        encode_param(ID_PARAM, &Param::UInt(id), &mut section)?;
    }

    if section.len() > MAX_REQUEST_SIZE {
        return Err(Error::size_limit(format!(
            "request section is {} bytes, limit is {}",
            section.len(),
            MAX_REQUEST_SIZE
        )));
    }

    buf.reserve(2 + section.len());
    buf.put_u16_le(section.len() as u16);
    buf.put(section);
    Ok(buf.len())
}

fn encode_param(name: &str, param: &Param, buf: &mut BytesMut) -> Result<()> {
    let name = name.as_bytes();
    if name.len() > MAX_PARAM_NAME_LEN {
        return Err(Error::size_limit(format!(
            "parameter name is {} bytes, limit is {}",
            name.len(),
            MAX_PARAM_NAME_LEN
        )));
    }

    let negative;
    let (param_type, value) = match param {
        Param::Int(n) if *n < 0 => {
            negative = n.to_string();
            (ParamType::String, ParamValue::Str(&negative))
        }
        Param::Int(n) => (ParamType::Number, ParamValue::Num(*n as u64)),
        Param::UInt(n) => (ParamType::Number, ParamValue::Num(*n)),
        Param::Str(s) => (ParamType::String, ParamValue::Str(s)),
        Param::Bool(b) => (ParamType::Boolean, ParamValue::Bool(*b)),
    };

    // ToPrimitive on a fieldless enum never fails
    let type_bits = param_type.to_u8().unwrap_or(0);
    buf.put_u8(type_bits << RQ_PARAM_TYPE_SHIFT | name.len() as u8);
    buf.put_slice(name);
    match value {
        ParamValue::Str(s) => {
            if s.len() > MAX_REQUEST_SIZE {
                return Err(Error::size_limit(format!(
                    "parameter value is {} bytes, limit is {}",
                    s.len(),
                    MAX_REQUEST_SIZE
                )));
            }
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        ParamValue::Num(n) => buf.put_u64_le(n),
        ParamValue::Bool(b) => buf.put_u8(b as u8),
    }
    Ok(())
}

enum ParamValue<'a> {
    Str(&'a str),
    Num(u64),
    Bool(bool),
}

/// Writes an encoded frame followed by the request payload, streamed
/// straight from its source. Returns the total bytes written.
pub fn write_request<W: Write + ?Sized>(
    request: &Request,
    frame: &[u8],
    out: &mut W,
) -> Result<u64> {
    out.write_all(frame)?;
    let mut written = frame.len() as u64;

    if let Some(data) = request.data() {
        let expected = data.len();
        let mut source = data.open()?.take(expected);
        let copied = io::copy(&mut source, out)?;
        if copied != expected {
            return Err(Error::protocol(format!(
                "payload source yielded {} of {} declared bytes",
                copied, expected
            )));
        }
        written += copied;
    }

    out.flush()?;
    Ok(written)
}

/// Reads one request frame. The payload, if any, is left on the stream for
/// the caller to consume (`data_len` bytes).
pub fn decode_request<R: Read + ?Sized>(input: &mut R) -> Result<RequestFrame> {
    let size = input.read_u16::<LittleEndian>()? as usize;
    let mut section = vec![0u8; size];
    input.read_exact(&mut section)?;
    let mut cur = io::Cursor::new(section.as_slice());

    let name_byte = cur.read_u8()?;
    let method = read_utf8(&mut cur, (name_byte & RQ_NAME_LEN_MASK) as usize)?;
    let data_len = if name_byte & RQ_DATA_FLAG != 0 {
        Some(cur.read_u64::<LittleEndian>()?)
    } else {
        None
    };

    let count = cur.read_u8()? as usize;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let header = cur.read_u8()?;
        let param_type = ParamType::from_u8(header >> RQ_PARAM_TYPE_SHIFT)
            .ok_or_else(|| {
                Error::protocol(format!("unknown parameter type in {:#04x}", header))
            })?;
        let name = read_utf8(&mut cur, (header & RQ_PARAM_NAME_MASK) as usize)?;
        let value = match param_type {
            ParamType::String => {
                let len = cur.read_u32::<LittleEndian>()? as usize;
                Param::Str(read_utf8(&mut cur, len)?)
            }
            ParamType::Number => Param::UInt(cur.read_u64::<LittleEndian>()?),
            ParamType::Boolean => Param::Bool(cur.read_u8()? != 0),
        };
        params.push((name, value));
    }

    if (cur.position() as usize) != size {
        return Err(Error::protocol("trailing bytes after request parameters"));
    }

    Ok(RequestFrame {
        method,
        params,
        data_len,
    })
}

fn read_utf8<R: Read>(input: &mut R, len: usize) -> Result<String> {
    let mut raw = vec![0u8; len];
    input.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| Error::protocol("string is not valid UTF-8"))
}

/// Encodes a response: the 4-byte length, then `value` (which must be an
/// object). With `data_len`, a data marker is placed under [`DATA_FIELD`]
/// as the last top-level entry; the payload bytes themselves are written
/// by the caller right after.
pub fn encode_response(value: &Value, data_len: Option<u64>) -> Result<BytesMut> {
    let map = match value {
        Value::Object(map) => map,
        _ => return Err(Error::protocol("top-level response value must be an object")),
    };

    let mut enc = ResponseEncoder {
        buf: BytesMut::with_capacity(128),
        cache: HashMap::new(),
    };
    enc.buf.put_u8(tag::OBJECT);
    for (k, v) in map {
        enc.string(k);
        enc.value(v)?;
    }
    if let Some(len) = data_len {
        enc.string(DATA_FIELD);
        enc.buf.put_u8(tag::DATA);
        enc.buf.put_u64_le(len);
    }
    enc.buf.put_u8(tag::END);

    let mut out = BytesMut::with_capacity(4 + enc.buf.len());
    out.put_u32_le(enc.buf.len() as u32);
    out.put(enc.buf);
    Ok(out)
}

struct ResponseEncoder {
    buf: BytesMut,
    cache: HashMap<String, usize>,
}

impl ResponseEncoder {
    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => {
                return Err(Error::protocol("null has no wire representation"))
            }
            Value::Bool(false) => self.buf.put_u8(tag::FALSE),
            Value::Bool(true) => self.buf.put_u8(tag::TRUE),
            Value::Number(n) => match n.as_u64() {
                Some(u) => self.integer(u),
                None => self.string(&n.to_string()),
            },
            Value::String(s) => self.string(s),
            Value::Array(items) => {
                self.buf.put_u8(tag::ARRAY);
                for item in items {
                    self.value(item)?;
                }
                self.buf.put_u8(tag::END);
            }
            Value::Object(map) => {
                self.buf.put_u8(tag::OBJECT);
                for (k, v) in map {
                    self.string(k);
                    self.value(v)?;
                }
                self.buf.put_u8(tag::END);
            }
        }
        Ok(())
    }

    fn integer(&mut self, n: u64) {
        let small = (tag::SMALL_INT_LAST - tag::SMALL_INT) as u64;
        if n <= small {
            self.buf.put_u8(tag::SMALL_INT + n as u8);
        } else {
            let width = byte_width(n);
            self.buf.put_u8(tag::INT + width as u8 - 1);
            self.buf.put_uint_le(n, width);
        }
    }

    fn string(&mut self, s: &str) {
        if let Some(&idx) = self.cache.get(s) {
            let short = (tag::SHORT_CACHED_LAST - tag::SHORT_CACHED) as usize;
            if idx <= short {
                self.buf.put_u8(tag::SHORT_CACHED + idx as u8);
            } else {
                let width = byte_width(idx as u64);
                self.buf.put_u8(tag::CACHED + width as u8 - 1);
                self.buf.put_uint_le(idx as u64, width);
            }
            return;
        }

        let len = s.len();
        let short = (tag::SHORT_STRING_LAST - tag::SHORT_STRING) as usize;
        if len <= short {
            self.buf.put_u8(tag::SHORT_STRING + len as u8);
        } else {
            let width = byte_width(len as u64).min(4);
            self.buf.put_u8(tag::STRING + width as u8 - 1);
            self.buf.put_uint_le(len as u64, width);
        }
        self.buf.put_slice(s.as_bytes());
        let idx = self.cache.len();
        self.cache.insert(s.to_string(), idx);
    }
}

fn byte_width(n: u64) -> usize {
    let bits = 64 - n.leading_zeros() as usize;
    ((bits + 7) / 8).max(1)
}
