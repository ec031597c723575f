//! Canonical binary encoding of values.
//!
//! Each value is written as a one-byte type tag followed by its payload.
//! Lengths and integers are big-endian. The encoding is a bijection: every
//! value has exactly one byte representation and decoding rejects anything
//! that is not the output of [`encode`]. This is what makes deterministic
//! encryption sound.
//!
//! ```text
//! double    0x01 [f64 bits:8]
//! string    0x02 [len:4][utf8:len]
//! document  0x03 [count:4] ([key len:4][key][value])*
//! array     0x04 [count:4] (value)*
//! binary    0x05 [subtype:1][len:4][bytes:len]
//! bool      0x08 [0|1]
//! date      0x09 [millis:8]
//! null      0x0A
//! int32     0x10 [i32:4]
//! int64     0x12 [i64:8]
//! ```

use crate::error::{Error, Result};
use crate::schema::ValueType;
use crate::value::{subtype, Binary, Document, Value};

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_BOOL: u8 = 0x08;
const TAG_DATETIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_INT32: u8 = 0x10;
const TAG_INT64: u8 = 0x12;

/// Maximum nesting depth of a value. Both [`encode`] and [`decode`]
/// enforce it, so every encodable value is decodable.
pub const MAX_DEPTH: usize = 100;

/// Coerces `value` to the declared type so that logically equal values share
/// one encoding (e.g. an `int` field holding an `Int64` that fits in 32 bits).
///
/// # Errors
///
/// Returns `Error::SchemaMismatch` if the value cannot be represented as the
/// declared type.
pub fn coerce(value: &Value, declared: ValueType, path: &str) -> Result<Value> {
    let coerced = match (declared, value) {
        (ValueType::String, Value::String(_))
        | (ValueType::Int, Value::Int32(_))
        | (ValueType::Long, Value::Int64(_))
        | (ValueType::Double, Value::Double(_))
        | (ValueType::Bool, Value::Bool(_))
        | (ValueType::Date, Value::DateTime(_))
        | (ValueType::Object, Value::Document(_))
        | (ValueType::Array, Value::Array(_)) => value.clone(),
        (ValueType::BinData, Value::Binary(bin)) if bin.subtype != subtype::ENCRYPTED => {
            value.clone()
        }
        (ValueType::Int, Value::Int64(v)) => Value::Int32(i32::try_from(*v).map_err(|_| {
            Error::mismatch(path, format!("value {v} does not fit the declared type `int`"))
        })?),
        (ValueType::Long, Value::Int32(v)) => Value::Int64(i64::from(*v)),
        (ValueType::Double, Value::Int32(v)) => Value::Double(f64::from(*v)),
        _ => {
            return Err(Error::mismatch(
                path,
                format!(
                    "declared type `{}` but found `{}`",
                    declared.as_str(),
                    value.type_name()
                ),
            ))
        }
    };
    Ok(coerced)
}

/// Encodes a value into its canonical byte form.
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if a string, binary or container is too
/// large to be length-prefixed, or if the value nests deeper than
/// [`MAX_DEPTH`].
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_value(&mut out, value, 0)?;
    Ok(out)
}

/// Decodes a value previously produced by [`encode`].
///
/// # Errors
///
/// Returns `Error::DecryptionFailed` on unknown tags, truncation, trailing
/// bytes, invalid UTF-8 or excessive nesting.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = reader.read_value(0)?;
    if reader.pos != bytes.len() {
        return Err(malformed("trailing bytes after value"));
    }
    Ok(value)
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::EncryptionFailed(format!("length {len} exceeds u32")))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    write_len(out, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::EncryptionFailed(format!(
            "value nests deeper than {MAX_DEPTH} levels"
        )));
    }
    match value {
        Value::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_str(out, s)?;
        }
        Value::Document(doc) => {
            out.push(TAG_DOCUMENT);
            write_len(out, doc.len())?;
            for (key, v) in doc.iter() {
                write_str(out, key)?;
                write_value(out, v, depth + 1)?;
            }
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            write_len(out, items.len())?;
            for v in items {
                write_value(out, v, depth + 1)?;
            }
        }
        Value::Binary(bin) => {
            out.push(TAG_BINARY);
            out.push(bin.subtype);
            write_len(out, bin.bytes.len())?;
            out.extend_from_slice(&bin.bytes);
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::DateTime(ms) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&ms.to_be_bytes());
        }
        Value::Null => out.push(TAG_NULL),
        Value::Int32(v) => {
            out.push(TAG_INT32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int64(v) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
    Ok(())
}

fn malformed(msg: &str) -> Error {
    Error::DecryptionFailed(format!("malformed plaintext encoding: {msg}"))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let end = end.ok_or_else(|| malformed("truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = u32::from_be_bytes(self.array()?);
        usize::try_from(len).map_err(|_| malformed("length overflow"))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8"))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(malformed("nesting too deep"));
        }
        let [tag] = self.array::<1>()?;
        let value = match tag {
            TAG_DOUBLE => Value::Double(f64::from_bits(u64::from_be_bytes(self.array()?))),
            TAG_STRING => Value::String(self.read_string()?),
            TAG_DOCUMENT => {
                let count = self.read_len()?;
                let mut doc = Document::new();
                for _ in 0..count {
                    let key = self.read_string()?;
                    if doc.get(&key).is_some() {
                        return Err(malformed("duplicate field name"));
                    }
                    let v = self.read_value(depth + 1)?;
                    doc.insert(key, v);
                }
                Value::Document(doc)
            }
            TAG_ARRAY => {
                let count = self.read_len()?;
                // Each element needs at least one byte; bound the allocation.
                let mut items = Vec::with_capacity(count.min(self.buf.len() - self.pos));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Value::Array(items)
            }
            TAG_BINARY => {
                let [subtype] = self.array::<1>()?;
                let len = self.read_len()?;
                Value::Binary(Binary { subtype, bytes: self.take(len)?.to_vec() })
            }
            TAG_BOOL => match self.array::<1>()? {
                [0] => Value::Bool(false),
                [1] => Value::Bool(true),
                _ => return Err(malformed("invalid boolean")),
            },
            TAG_DATETIME => Value::DateTime(i64::from_be_bytes(self.array()?)),
            TAG_NULL => Value::Null,
            TAG_INT32 => Value::Int32(i32::from_be_bytes(self.array()?)),
            TAG_INT64 => Value::Int64(i64::from_be_bytes(self.array()?)),
            other => return Err(malformed(&format!("unknown type tag 0x{other:02x}"))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_fixed_vectors() {
        assert_eq!(hex::encode(encode(&Value::Int32(241_014_209)).unwrap()), "100e5d95c1");
        assert_eq!(hex::encode(encode(&Value::from("AB+")).unwrap()), "020000000341422b");
        assert_eq!(hex::encode(encode(&Value::Null).unwrap()), "0a");
    }

    #[test]
    fn test_nested_round_trip() {
        let value = Value::from(json!({
            "weight": 180,
            "notes": ["a", null, 2.5],
            "inner": { "flag": true }
        }));
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_int_and_long_canonicalize_identically() {
        let as_int = coerce(&Value::Int64(42), ValueType::Int, "n").unwrap();
        assert_eq!(encode(&as_int).unwrap(), encode(&Value::Int32(42)).unwrap());

        let as_long = coerce(&Value::Int32(42), ValueType::Long, "n").unwrap();
        assert_eq!(encode(&as_long).unwrap(), encode(&Value::Int64(42)).unwrap());
    }

    #[test]
    fn test_coerce_rejects_wrong_type() {
        let err = coerce(&Value::from("x"), ValueType::Int, "ssn").unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { ref path, .. } if path == "ssn"));

        let err = coerce(&Value::Int64(i64::MAX), ValueType::Int, "ssn").unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));

        let blob = Value::encrypted(vec![1]);
        assert!(coerce(&blob, ValueType::BinData, "b").is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7f]).is_err());
        assert!(decode(&[TAG_INT32, 0, 0]).is_err());
        assert!(decode(&[TAG_NULL, TAG_NULL]).is_err());
        assert!(decode(&[TAG_BOOL, 2]).is_err());
        assert!(decode(&[TAG_STRING, 0, 0, 0, 2, 0xff, 0xfe]).is_err());
        assert!(decode(&[TAG_ARRAY, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    fn nested(levels: usize) -> Value {
        (0..levels).fold(Value::Int32(7), |inner, _| Value::Array(vec![inner]))
    }

    #[test]
    fn test_depth_limit_is_symmetric() {
        let deepest = nested(MAX_DEPTH);
        assert_eq!(decode(&encode(&deepest).unwrap()).unwrap(), deepest);

        let err = encode(&nested(MAX_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, Error::EncryptionFailed(_)));
        assert!(encode(&nested(MAX_DEPTH + 2)).is_err());

        let mut doc = Document::new();
        doc.insert("inner", nested(MAX_DEPTH));
        assert!(encode(&Value::Document(doc)).is_err());
    }

    #[test]
    fn test_decode_rejects_duplicate_keys() {
        let mut bytes = vec![TAG_DOCUMENT, 0, 0, 0, 2];
        for _ in 0..2 {
            bytes.extend_from_slice(&[0, 0, 0, 1, b'a', TAG_NULL]);
        }
        assert!(decode(&bytes).is_err());
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int32),
            any::<i64>().prop_map(Value::Int64),
            any::<i64>().prop_map(Value::DateTime),
            ".*".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..32)
                .prop_map(|bytes| Value::Binary(Binary { subtype: 0, bytes })),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(v in scalar()) {
            prop_assert_eq!(decode(&encode(&v).unwrap()).unwrap(), v);
        }

        #[test]
        fn prop_distinct_values_distinct_bytes(a in scalar(), b in scalar()) {
            prop_assume!(a != b);
            prop_assert_ne!(encode(&a).unwrap(), encode(&b).unwrap());
        }
    }
}
