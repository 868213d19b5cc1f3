//! Order-preserving tuple encoding for KV keys and values.
//!
//! Packed tuples compare bytewise in the same order as the tuples compare
//! element by element, so range scans over a packed prefix visit exactly the
//! keys that start with that prefix.

use slime_lib::{SlimeError, SlimeResult};

const CODE_BYTES: u8 = 0x01;
const CODE_STR: u8 = 0x02;
const CODE_INT_ZERO: u8 = 0x14;
const CODE_FALSE: u8 = 0x26;
const CODE_TRUE: u8 = 0x27;
const ESCAPE: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleItem {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    Bool(bool),
}

impl TupleItem {
    pub fn bytes(v: &[u8]) -> Self {
        TupleItem::Bytes(v.to_vec())
    }

    pub fn str(v: &str) -> Self {
        TupleItem::Str(v.to_string())
    }

    pub fn as_bytes(&self) -> SlimeResult<&[u8]> {
        match self {
            TupleItem::Bytes(b) => Ok(b),
            other => Err(type_err("bytes", other)),
        }
    }

    pub fn as_str(&self) -> SlimeResult<&str> {
        match self {
            TupleItem::Str(s) => Ok(s),
            other => Err(type_err("string", other)),
        }
    }

    pub fn as_int(&self) -> SlimeResult<i64> {
        match self {
            TupleItem::Int(i) => Ok(*i),
            other => Err(type_err("int", other)),
        }
    }

    pub fn as_bool(&self) -> SlimeResult<bool> {
        match self {
            TupleItem::Bool(b) => Ok(*b),
            other => Err(type_err("bool", other)),
        }
    }
}

fn type_err(want: &str, got: &TupleItem) -> SlimeError {
    SlimeError::BadFormat(format!("tuple: expected {}, found {:?}", want, got))
}

pub fn pack(items: &[TupleItem]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        match item {
            TupleItem::Bytes(b) => {
                out.push(CODE_BYTES);
                push_escaped(&mut out, b);
            }
            TupleItem::Str(s) => {
                out.push(CODE_STR);
                push_escaped(&mut out, s.as_bytes());
            }
            TupleItem::Int(v) => push_int(&mut out, *v),
            TupleItem::Bool(b) => out.push(if *b { CODE_TRUE } else { CODE_FALSE }),
        }
    }
    out
}

fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for b in data {
        out.push(*b);
        if *b == 0 {
            out.push(ESCAPE);
        }
    }
    out.push(0);
}

fn push_int(out: &mut Vec<u8>, v: i64) {
    if v == 0 {
        out.push(CODE_INT_ZERO);
        return;
    }
    let magnitude = v.unsigned_abs();
    let n = 8 - (magnitude.leading_zeros() / 8) as usize;
    if v > 0 {
        out.push(CODE_INT_ZERO + n as u8);
        out.extend_from_slice(&magnitude.to_be_bytes()[8 - n..]);
    } else {
        out.push(CODE_INT_ZERO - n as u8);
        out.extend_from_slice(&(!magnitude).to_be_bytes()[8 - n..]);
    }
}

pub fn unpack(data: &[u8]) -> SlimeResult<Vec<TupleItem>> {
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let code = data[pos];
        pos += 1;
        match code {
            CODE_BYTES => {
                let (raw, next) = read_escaped(data, pos)?;
                items.push(TupleItem::Bytes(raw));
                pos = next;
            }
            CODE_STR => {
                let (raw, next) = read_escaped(data, pos)?;
                let s = String::from_utf8(raw)
                    .map_err(|e| SlimeError::BadFormat(format!("tuple: bad utf8: {}", e)))?;
                items.push(TupleItem::Str(s));
                pos = next;
            }
            0x0c..=0x1c => {
                let (v, next) = read_int(data, pos, code)?;
                items.push(TupleItem::Int(v));
                pos = next;
            }
            CODE_FALSE => items.push(TupleItem::Bool(false)),
            CODE_TRUE => items.push(TupleItem::Bool(true)),
            other => {
                return Err(SlimeError::BadFormat(format!(
                    "tuple: unknown type code 0x{:02x} at {}",
                    other,
                    pos - 1
                )))
            }
        }
    }
    Ok(items)
}

fn read_escaped(data: &[u8], mut pos: usize) -> SlimeResult<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    while pos < data.len() {
        let b = data[pos];
        if b == 0 {
            if data.get(pos + 1) == Some(&ESCAPE) {
                out.push(0);
                pos += 2;
                continue;
            }
            return Ok((out, pos + 1));
        }
        out.push(b);
        pos += 1;
    }
    Err(SlimeError::BadFormat("tuple: unterminated string".to_string()))
}

fn read_int(data: &[u8], pos: usize, code: u8) -> SlimeResult<(i64, usize)> {
    let negative = code < CODE_INT_ZERO;
    let n = if negative {
        (CODE_INT_ZERO - code) as usize
    } else {
        (code - CODE_INT_ZERO) as usize
    };
    let raw = data
        .get(pos..pos + n)
        .ok_or_else(|| SlimeError::BadFormat("tuple: truncated int".to_string()))?;
    let mut buf = [0u8; 8];
    buf[8 - n..].copy_from_slice(raw);
    let x = u64::from_be_bytes(buf);

    let v = if negative {
        let mask = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        let magnitude = !x & mask;
        0i64.checked_sub_unsigned(magnitude)
            .ok_or_else(|| SlimeError::BadFormat("tuple: int out of range".to_string()))?
    } else {
        i64::try_from(x).map_err(|_| SlimeError::BadFormat("tuple: int out of range".to_string()))?
    };
    Ok((v, pos + n))
}

/// Key range `[low, high)` covering every key that extends `prefix` with at
/// least one more element.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut low = prefix.to_vec();
    low.push(0x00);
    let mut high = prefix.to_vec();
    high.push(0xff);
    (low, high)
}

/// The smallest key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut k = key.to_vec();
    k.push(0x00);
    k
}
