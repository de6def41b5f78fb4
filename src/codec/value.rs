//! Recursive tagged-value encoding.
//!
//! Generic message payloads travel as a [`Value`]: a one-byte type tag
//! followed by the value's own encoding. Maps recurse through the same
//! scheme, homogeneous arrays write one element tag for the whole run, and
//! anything without a native tag falls back to a JSON string.
//!
//! The encoding round-trips: `decode(encode(v)) == v` for every supported
//! shape, including nested maps and arrays of arrays; floats are preserved
//! bit-for-bit.

use crate::config::{MAX_VALUE_DEPTH, MAX_WIRE_LEN};
use crate::error::{NetError, Result};
use crate::codec::wire::{WireReader, WireWriter};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Type tag bytes preceding every encoded value.
pub mod tag {
    pub const NULL: u8 = 0;
    pub const STR: u8 = 1;
    pub const BYTE: u8 = 2;
    pub const I32: u8 = 3;
    pub const I16: u8 = 4;
    pub const I64: u8 = 5;
    pub const F32: u8 = 6;
    pub const F64: u8 = 7;
    pub const BOOL: u8 = 8;
    pub const BYTES: u8 = 9;
    pub const MAP: u8 = 10;
    pub const ARRAY: u8 = 11;
    /// JSON-string fallback at the top level; inside an array header it
    /// marks a heterogeneous element run where every element carries its
    /// own tag.
    pub const JSON: u8 = 12;
}

/// A dynamically-typed wire value.
///
/// This is the sum type behind generic payloads; the decode match is
/// exhaustive, so an unknown tag can never slip through silently.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Byte(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// String-keyed map; values recurse through the tag scheme.
    Map(BTreeMap<String, Value>),
    Array(Array),
    /// Structured object without a native tag, carried as JSON text.
    Json(serde_json::Value),
}

/// Array payloads: one element-type tag for the whole run.
///
/// Primitive runs store raw elements back to back; `Mixed` runs (element
/// tag 12) write each element as a complete tagged value, which is what
/// lets mixed-type arrays and arrays of arrays round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Str(Vec<String>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Mixed(Vec<Value>),
}

impl Array {
    pub fn len(&self) -> usize {
        match self {
            Array::Str(v) => v.len(),
            Array::I16(v) => v.len(),
            Array::I32(v) => v.len(),
            Array::I64(v) => v.len(),
            Array::F32(v) => v.len(),
            Array::F64(v) => v.len(),
            Array::Bool(v) => v.len(),
            Array::Mixed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn element_tag(&self) -> u8 {
        match self {
            Array::Str(_) => tag::STR,
            Array::I16(_) => tag::I16,
            Array::I32(_) => tag::I32,
            Array::I64(_) => tag::I64,
            Array::F32(_) => tag::F32,
            Array::F64(_) => tag::F64,
            Array::Bool(_) => tag::BOOL,
            Array::Mixed(_) => tag::JSON,
        }
    }
}

impl Value {
    /// Encode this value, tag first, into `w`.
    pub fn write(&self, w: &mut WireWriter) -> Result<()> {
        match self {
            Value::Null => w.write_u8(tag::NULL),
            Value::Str(s) => {
                w.write_u8(tag::STR)?;
                w.write_string(s)
            }
            Value::Byte(b) => {
                w.write_u8(tag::BYTE)?;
                w.write_u8(*b)
            }
            Value::I16(v) => {
                w.write_u8(tag::I16)?;
                w.write_i16(*v)
            }
            Value::I32(v) => {
                w.write_u8(tag::I32)?;
                w.write_i32(*v)
            }
            Value::I64(v) => {
                w.write_u8(tag::I64)?;
                w.write_i64(*v)
            }
            Value::F32(v) => {
                w.write_u8(tag::F32)?;
                w.write_f32(*v)
            }
            Value::F64(v) => {
                w.write_u8(tag::F64)?;
                w.write_f64(*v)
            }
            Value::Bool(v) => {
                w.write_u8(tag::BOOL)?;
                w.write_bool(*v)
            }
            Value::Bytes(v) => {
                w.write_u8(tag::BYTES)?;
                w.write_bytes(v)
            }
            Value::Map(m) => {
                w.write_u8(tag::MAP)?;
                w.write_i32(m.len() as i32)?;
                for (k, v) in m {
                    w.write_string(k)?;
                    v.write(w)?;
                }
                Ok(())
            }
            Value::Array(a) => {
                w.write_u8(tag::ARRAY)?;
                w.write_i32(a.len() as i32)?;
                w.write_u8(a.element_tag())?;
                match a {
                    Array::Str(v) => {
                        for s in v {
                            w.write_string(s)?;
                        }
                    }
                    Array::I16(v) => {
                        for x in v {
                            w.write_i16(*x)?;
                        }
                    }
                    Array::I32(v) => {
                        for x in v {
                            w.write_i32(*x)?;
                        }
                    }
                    Array::I64(v) => {
                        for x in v {
                            w.write_i64(*x)?;
                        }
                    }
                    Array::F32(v) => {
                        for x in v {
                            w.write_f32(*x)?;
                        }
                    }
                    Array::F64(v) => {
                        for x in v {
                            w.write_f64(*x)?;
                        }
                    }
                    Array::Bool(v) => {
                        for x in v {
                            w.write_bool(*x)?;
                        }
                    }
                    Array::Mixed(v) => {
                        for x in v {
                            x.write(w)?;
                        }
                    }
                }
                Ok(())
            }
            Value::Json(j) => {
                w.write_u8(tag::JSON)?;
                let text = serde_json::to_string(j)
                    .map_err(|e| NetError::Encode(format!("JSON fallback: {e}")))?;
                w.write_string(&text)
            }
        }
    }

    /// Decode one tagged value from `r`.
    pub async fn read(r: &mut WireReader<'_>) -> Result<Value> {
        read_depth(r, 0).await
    }

    /// Shorthand: decode that insists on a map payload.
    pub async fn read_map(r: &mut WireReader<'_>) -> Result<BTreeMap<String, Value>> {
        match Self::read(r).await? {
            Value::Map(m) => Ok(m),
            other => Err(NetError::Decode(format!(
                "expected map payload, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Human-readable name of this value's shape, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Str(_) => "string",
            Value::Byte(_) => "byte",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Json(_) => "json",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

fn read_depth<'a, 'b: 'a>(
    r: &'a mut WireReader<'b>,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_VALUE_DEPTH {
            return Err(NetError::Decode(format!(
                "value nesting exceeds depth {MAX_VALUE_DEPTH}"
            )));
        }

        let t = r.read_u8().await?;
        match t {
            tag::NULL => Ok(Value::Null),
            tag::STR => Ok(Value::Str(r.read_string().await?)),
            tag::BYTE => Ok(Value::Byte(r.read_u8().await?)),
            tag::I16 => Ok(Value::I16(r.read_i16().await?)),
            tag::I32 => Ok(Value::I32(r.read_i32().await?)),
            tag::I64 => Ok(Value::I64(r.read_i64().await?)),
            tag::F32 => Ok(Value::F32(r.read_f32().await?)),
            tag::F64 => Ok(Value::F64(r.read_f64().await?)),
            tag::BOOL => Ok(Value::Bool(r.read_bool().await?)),
            tag::BYTES => Ok(Value::Bytes(r.read_bytes().await?)),
            tag::MAP => {
                let count = read_count(r).await?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = r.read_string().await?;
                    let value = read_depth(&mut *r, depth + 1).await?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            tag::ARRAY => {
                let count = read_count(r).await?;
                let elem = r.read_u8().await?;
                let array = match elem {
                    tag::STR => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_string().await?);
                        }
                        Array::Str(v)
                    }
                    tag::I16 => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_i16().await?);
                        }
                        Array::I16(v)
                    }
                    tag::I32 => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_i32().await?);
                        }
                        Array::I32(v)
                    }
                    tag::I64 => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_i64().await?);
                        }
                        Array::I64(v)
                    }
                    tag::F32 => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_f32().await?);
                        }
                        Array::F32(v)
                    }
                    tag::F64 => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_f64().await?);
                        }
                        Array::F64(v)
                    }
                    tag::BOOL => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(r.read_bool().await?);
                        }
                        Array::Bool(v)
                    }
                    tag::JSON => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(read_depth(&mut *r, depth + 1).await?);
                        }
                        Array::Mixed(v)
                    }
                    other => {
                        return Err(NetError::Decode(format!(
                            "unknown array element tag {other}"
                        )))
                    }
                };
                Ok(Value::Array(array))
            }
            tag::JSON => {
                let text = r.read_string().await?;
                let parsed = serde_json::from_str(&text)
                    .map_err(|e| NetError::Decode(format!("JSON fallback: {e}")))?;
                Ok(Value::Json(parsed))
            }
            other => Err(NetError::Decode(format!("unknown value tag {other}"))),
        }
    })
}

async fn read_count(r: &mut WireReader<'_>) -> Result<usize> {
    let count = r.read_i32().await?;
    if count < 0 {
        return Err(NetError::Decode(format!("negative element count: {count}")));
    }
    let count = count as usize;
    if count > MAX_WIRE_LEN {
        return Err(NetError::OversizedLength(count));
    }
    Ok(count)
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Value::Map(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn roundtrip(v: &Value) -> Value {
        let mut w = WireWriter::new();
        v.write(&mut w).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        Value::read(&mut r).await.unwrap()
    }

    #[tokio::test]
    async fn scalar_roundtrips() {
        for v in [
            Value::Null,
            Value::Str("phoenix".into()),
            Value::Byte(7),
            Value::I16(-42),
            Value::I32(123_456),
            Value::I64(-9_999_999_999),
            Value::F32(std::f32::consts::PI),
            Value::F64(std::f64::consts::E),
            Value::Bool(true),
            Value::Bytes(vec![0, 255, 128]),
        ] {
            assert_eq!(roundtrip(&v).await, v);
        }
    }

    #[tokio::test]
    async fn nested_map_roundtrip() {
        let inner: Value = [
            ("hp".to_string(), Value::I32(100)),
            ("name".to_string(), Value::Str("orc".into())),
        ]
        .into_iter()
        .collect();
        let outer: Value = [
            ("entity".to_string(), inner),
            ("room".to_string(), Value::Str("arena".into())),
            ("tags".to_string(), Value::Array(Array::Str(vec!["a".into(), "b".into()]))),
        ]
        .into_iter()
        .collect();

        assert_eq!(roundtrip(&outer).await, outer);
    }

    #[tokio::test]
    async fn array_of_arrays_roundtrip() {
        let v = Value::Array(Array::Mixed(vec![
            Value::Array(Array::I32(vec![1, 2, 3])),
            Value::Array(Array::Bool(vec![true, false])),
            Value::Str("tail".into()),
        ]));
        assert_eq!(roundtrip(&v).await, v);
    }

    #[tokio::test]
    async fn json_fallback_roundtrip() {
        let v = Value::Json(serde_json::json!({"a": [1, 2], "b": {"c": null}}));
        assert_eq!(roundtrip(&v).await, v);
    }

    #[tokio::test]
    async fn float_bits_preserved() {
        let odd = f64::from_bits(0x7FF0_0000_0000_0001); // signaling-ish NaN pattern
        let mut w = WireWriter::new();
        Value::F64(odd).write(&mut w).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        match Value::read(&mut r).await.unwrap() {
            Value::F64(out) => assert_eq!(out.to_bits(), odd.to_bits()),
            other => panic!("wrong shape: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_is_decode_error() {
        let mut src: &[u8] = &[200u8];
        let mut r = WireReader::new(&mut src);
        assert!(matches!(Value::read(&mut r).await, Err(NetError::Decode(_))));
    }

    #[tokio::test]
    async fn depth_bound_enforced() {
        // Hand-build nesting deeper than the cap: MAP count=1, key "", then
        // another MAP, repeated.
        let mut bytes = Vec::new();
        for _ in 0..(MAX_VALUE_DEPTH + 2) {
            bytes.push(tag::MAP);
            bytes.extend_from_slice(&1i32.to_le_bytes());
            bytes.extend_from_slice(&0i32.to_le_bytes()); // empty key
        }
        bytes.push(tag::NULL);

        let mut src: &[u8] = &bytes;
        let mut r = WireReader::new(&mut src);
        assert!(matches!(Value::read(&mut r).await, Err(NetError::Decode(_))));
    }
}
