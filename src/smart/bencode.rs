//! Minimal bencode codec for protocol v3 headers and argument structures.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Nesting bound for decoded structures.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// A list of byte strings, the shape of every argument tuple.
    pub fn string_list<S: AsRef<str>>(items: &[S]) -> Self {
        Value::List(
            items
                .iter()
                .map(|s| Value::Bytes(Bytes::copy_from_slice(s.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Inverse of [`string_list`](Self::string_list).
    pub fn into_string_list(self) -> Result<Vec<String>> {
        let Value::List(items) = self else {
            return Err(Error::framing("args structure is not a list"));
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Bytes(b) => String::from_utf8(b.to_vec())
                    .map_err(|_| Error::framing("non-UTF-8 argument")),
                Value::Int(i) => Ok(i.to_string()),
                other => Err(Error::framing(format!("unexpected argument {:?}", other))),
            })
            .collect()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::Int(i) => {
                buf.put_u8(b'i');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_u8(b'e');
            }
            Value::Bytes(b) => {
                buf.put_slice(b.len().to_string().as_bytes());
                buf.put_u8(b':');
                buf.put_slice(b);
            }
            Value::List(items) => {
                buf.put_u8(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.put_u8(b'e');
            }
            Value::Dict(map) => {
                buf.put_u8(b'd');
                for (key, value) in map {
                    Value::Bytes(key.clone()).encode_into(buf);
                    value.encode_into(buf);
                }
                buf.put_u8(b'e');
            }
        }
    }

    /// Decode exactly one value spanning all of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.value(0)?;
        if decoder.pos != data.len() {
            return Err(Error::framing("trailing bytes after bencoded value"));
        }
        Ok(value)
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::framing("truncated bencoded value"))
    }

    fn until(&mut self, terminator: u8) -> Result<&[u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == terminator)
            .ok_or_else(|| Error::framing("truncated bencoded value"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::framing("bencoded value nested too deeply"));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let digits = self.until(b'e')?;
                let n = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| Error::framing("bad bencoded integer"))?;
                Ok(Value::Int(n))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let Value::Bytes(key) = self.value(depth + 1)? else {
                        return Err(Error::framing("bencoded dict key is not a string"));
                    };
                    let value = self.value(depth + 1)?;
                    map.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(map))
            }
            b'0'..=b'9' => {
                let digits = self.until(b':')?;
                let len = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| Error::framing("bad bencoded string length"))?;
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|end| *end <= self.data.len())
                    .ok_or_else(|| Error::framing("truncated bencoded string"))?;
                let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
                self.pos = end;
                Ok(Value::Bytes(bytes))
            }
            other => Err(Error::framing(format!(
                "unexpected byte {:?} in bencoded value",
                other as char
            ))),
        }
    }
}
