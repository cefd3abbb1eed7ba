// Copyright 2020 Joyent, Inc.

//! Response decoding.
//!
//! A response is a 4-byte little-endian length followed by one value, which
//! must be an object. [`ValueDecoder`] carries the per-response state: the
//! number of declared bytes not yet consumed, the string cache and the data
//! marker seen so far. It reads from any `Read`, so the same code decodes
//! straight off a socket or from a buffered copy of a response.
//!
//! The decoder is `Clone`. Cloning it together with a cloned cursor gives a
//! peek: the clone can decode ahead while the original stays where it was.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::protocol::tag;

/// Maximum nesting of objects and arrays in one response.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone)]
pub struct ValueDecoder {
    length: u32,
    remaining: u64,
    cache: Vec<String>,
    data_len: Option<u64>,
    done: bool,
}

impl ValueDecoder {
    /// A decoder for a value section of `length` bytes whose length prefix
    /// was already consumed.
    pub fn new(length: u32) -> ValueDecoder {
        ValueDecoder {
            length,
            remaining: length as u64,
            cache: Vec::new(),
            data_len: None,
            done: false,
        }
    }

    /// Reads the length prefix of the next response. Lengths above
    /// `max_len` are rejected instead of being trusted.
    pub fn read_header<R: Read + ?Sized>(input: &mut R, max_len: u32) -> Result<ValueDecoder> {
        let length = input.read_u32::<LittleEndian>()?;
        if length > max_len {
            return Err(Error::protocol(format!(
                "response length {} exceeds limit {}",
                length, max_len
            )));
        }
        Ok(ValueDecoder::new(length))
    }

    /// Declared length of the value section.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Bytes of the value section not consumed yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// True once the top-level value was decoded and every declared byte
    /// consumed.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Payload length announced by a data marker, if one was decoded.
    pub fn data_len(&self) -> Option<u64> {
        self.data_len
    }

    pub fn cached_strings(&self) -> &[String] {
        &self.cache
    }

    /// Decodes the top-level object. The value must end exactly at the
    /// declared length.
    pub fn decode<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<Value> {
        if self.done {
            return Err(Error::IllegalState("response values already decoded"));
        }
        let first = self.read_u8(input)?;
        if first != tag::OBJECT {
            return Err(Error::protocol(format!(
                "top-level response value must be an object, got tag {}",
                first
            )));
        }
        let value = self.read_object(input, 1)?;
        if self.remaining != 0 {
            return Err(Error::protocol(format!(
                "{} trailing bytes after response value",
                self.remaining
            )));
        }
        self.done = true;
        Ok(value)
    }

    /// Decodes a clone of this decoder over a clone of `cursor`, leaving
    /// both originals untouched. Returns the values and the payload length
    /// the clone saw.
    pub fn peek(&self, cursor: &Cursor<Bytes>) -> Result<(Value, Option<u64>)> {
        let mut probe = self.clone();
        let mut ahead = cursor.clone();
        let value = probe.decode(&mut ahead)?;
        Ok((value, probe.data_len))
    }

    fn read_value<R: Read + ?Sized>(&mut self, input: &mut R, t: u8, depth: usize) -> Result<Value> {
        match t {
            tag::STRING..=tag::STRING_LAST => {
                let len = self.read_uint(input, (t - tag::STRING + 1) as usize)?;
                self.read_literal(input, len).map(Value::String)
            }
            tag::CACHED..=tag::CACHED_LAST => {
                let idx = self.read_uint(input, (t - tag::CACHED + 1) as usize)?;
                self.cached(idx).map(Value::String)
            }
            tag::INT..=tag::INT_LAST => {
                let n = self.read_uint(input, (t - tag::INT + 1) as usize)?;
                Ok(Value::from(n))
            }
            tag::OBJECT => self.read_object(input, depth + 1),
            tag::ARRAY => self.read_array(input, depth + 1),
            tag::FALSE => Ok(Value::Bool(false)),
            tag::TRUE => Ok(Value::Bool(true)),
            tag::DATA => {
                let len = self.read_uint(input, 8)?;
                if self.data_len.is_some() {
                    return Err(Error::protocol("second data marker in response"));
                }
                self.data_len = Some(len);
                Ok(Value::Null)
            }
            tag::SHORT_STRING..=tag::SHORT_STRING_LAST => {
                self.read_literal(input, (t - tag::SHORT_STRING) as u64).map(Value::String)
            }
            tag::SHORT_CACHED..=tag::SHORT_CACHED_LAST => {
                self.cached((t - tag::SHORT_CACHED) as u64).map(Value::String)
            }
            tag::SMALL_INT..=tag::SMALL_INT_LAST => Ok(Value::from(t - tag::SMALL_INT)),
            tag::END => Err(Error::protocol("unexpected end marker")),
            other => Err(Error::protocol(format!("unknown value tag {}", other))),
        }
    }

    fn read_object<R: Read + ?Sized>(&mut self, input: &mut R, depth: usize) -> Result<Value> {
        self.check_depth(depth)?;
        let mut map = Map::new();
        loop {
            let t = self.read_u8(input)?;
            if t == tag::END {
                return Ok(Value::Object(map));
            }
            let key = match self.read_value(input, t, depth)? {
                Value::String(key) => key,
                _ => return Err(Error::protocol(format!("object key has non-string tag {}", t))),
            };
            let t = self.read_u8(input)?;
            let value = self.read_value(input, t, depth)?;
            map.insert(key, value);
        }
    }

    fn read_array<R: Read + ?Sized>(&mut self, input: &mut R, depth: usize) -> Result<Value> {
        self.check_depth(depth)?;
        let mut items = Vec::new();
        loop {
            let t = self.read_u8(input)?;
            if t == tag::END {
                return Ok(Value::Array(items));
            }
            items.push(self.read_value(input, t, depth)?);
        }
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            Err(Error::protocol(format!("response nests deeper than {}", MAX_DEPTH)))
        } else {
            Ok(())
        }
    }

    fn read_literal<R: Read + ?Sized>(&mut self, input: &mut R, len: u64) -> Result<String> {
        self.consume(len)?;
        let mut raw = vec![0u8; len as usize];
        input.read_exact(&mut raw)?;
        let s = String::from_utf8(raw)
            .map_err(|_| Error::protocol("response string is not valid UTF-8"))?;
        self.cache.push(s.clone());
        Ok(s)
    }

    fn cached(&self, idx: u64) -> Result<String> {
        self.cache.get(idx as usize).cloned().ok_or_else(|| {
            Error::protocol(format!(
                "string reference {} outside cache of {}",
                idx,
                self.cache.len()
            ))
        })
    }

    fn read_u8<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<u8> {
        self.consume(1)?;
        Ok(input.read_u8()?)
    }

    fn read_uint<R: Read + ?Sized>(&mut self, input: &mut R, width: usize) -> Result<u64> {
        self.consume(width as u64)?;
        Ok(input.read_uint::<LittleEndian>(width)?)
    }

    fn consume(&mut self, n: u64) -> Result<()> {
        if n > self.remaining {
            return Err(Error::protocol(format!(
                "response runs past its declared length of {} bytes",
                self.length
            )));
        }
        self.remaining -= n;
        Ok(())
    }
}

/// Reads one complete response into memory: the decoder and a cursor over
/// its value section. Nothing of the response is left on `input`, except
/// a binary payload, which this never reads.
pub fn read_buffered<R: Read + ?Sized>(
    input: &mut R,
    max_len: u32,
) -> Result<(ValueDecoder, Cursor<Bytes>)> {
    let decoder = ValueDecoder::read_header(input, max_len)?;
    let mut raw = vec![0u8; decoder.length() as usize];
    input.read_exact(&mut raw)?;
    Ok((decoder, Cursor::new(Bytes::from(raw))))
}
