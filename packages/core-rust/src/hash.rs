//! Argument fingerprints for result-cache keys.
//!
//! A fingerprint is a BLAKE3 digest over a canonical encoding of
//! [`Arguments`]. Every value is prefixed with a one-byte type tag and every
//! variable-length item with its length, so structurally different arguments
//! cannot collide by concatenation (`["ab"]` vs `["a", "b"]`).
//!
//! # Order insensitivity
//!
//! `Arguments` and `Value::Map` are `BTreeMap`s, so object keys are always
//! visited in sorted order no matter how the caller built the map. Array
//! order is significant.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::types::{Arguments, Value};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_MAP: u8 = 7;

/// 256-bit digest identifying a set of arguments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint of `args`.
    ///
    /// # Examples
    ///
    /// ```
    /// use capgate_core::hash::Fingerprint;
    /// use capgate_core::types::{args, Value};
    ///
    /// let a = args([("x", Value::Int(1)), ("y", Value::Int(2))]);
    /// let b = args([("y", Value::Int(2)), ("x", Value::Int(1))]);
    /// assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    /// ```
    #[must_use]
    pub fn of(args: &Arguments) -> Self {
        let mut hasher = blake3::Hasher::new();
        write_map(&mut hasher, args);
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

fn write_len(hasher: &mut blake3::Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

fn write_map<'a, I>(hasher: &mut blake3::Hasher, entries: I)
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
    I::IntoIter: ExactSizeIterator,
{
    let entries = entries.into_iter();
    hasher.update(&[TAG_MAP]);
    write_len(hasher, entries.len());
    for (k, v) in entries {
        write_len(hasher, k.len());
        hasher.update(k.as_bytes());
        write_value(hasher, v);
    }
}

fn write_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(&[TAG_NULL]);
        }
        Value::Bool(b) => {
            hasher.update(&[TAG_BOOL, u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(&[TAG_INT]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(x) => {
            // -0.0 and 0.0 compare equal, so they must fingerprint equal.
            let x = if *x == 0.0 { 0.0 } else { *x };
            hasher.update(&[TAG_FLOAT]);
            hasher.update(&x.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(&[TAG_STRING]);
            write_len(hasher, s.len());
            hasher.update(s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update(&[TAG_BYTES]);
            write_len(hasher, b.len());
            hasher.update(b);
        }
        Value::Array(items) => {
            hasher.update(&[TAG_ARRAY]);
            write_len(hasher, items.len());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Map(map) => write_map(hasher, map),
    }
}
