//! Element codecs shared by the composite types.
//!
//! Strings carry a 4-byte little-endian length prefix inside composite
//! payloads; int64 and float are fixed 8-byte little-endian.

use std::cmp::Ordering;

use tessera_core::Primitive;

use crate::{float64, int64, string};

pub fn step<'a>(p: Primitive, buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    match p {
        Primitive::String => string::step(buf),
        Primitive::Int64 | Primitive::Float => {
            if buf.len() < 8 {
                return None;
            }

            let elem = &buf[..8];
            *buf = &buf[8..];
            Some(elem)
        }
    }
}

pub fn write(p: Primitive, elem: &[u8], out: &mut Vec<u8>) {
    match p {
        Primitive::String => string::write_elem(elem, out),
        Primitive::Int64 | Primitive::Float => out.extend_from_slice(elem),
    }
}

pub fn compare(p: Primitive, lhs: &[u8], rhs: &[u8]) -> Ordering {
    match p {
        Primitive::String => string::compare(lhs, rhs),
        Primitive::Int64 => int64::compare(lhs, rhs),
        Primitive::Float => float64::compare(lhs, rhs),
    }
}

pub fn validate(p: Primitive, value: &[u8]) -> bool {
    match p {
        Primitive::String => string::validate(value),
        Primitive::Int64 => value.len() == 8,
        Primitive::Float => value.len() == 8,
    }
}

/// Decode a whole composite payload into elements, or `None` when the
/// bytes do not split cleanly.
pub fn decode_all<'a>(p: Primitive, mut buf: &'a [u8]) -> Option<Vec<&'a [u8]>> {
    let mut out = Vec::new();

    while !buf.is_empty() {
        out.push(step(p, &mut buf)?);
    }

    Some(out)
}

/// Decode a whole map payload into key/value pairs.
pub fn decode_pairs<'a>(
    k: Primitive,
    v: Primitive,
    mut buf: &'a [u8],
) -> Option<Vec<(&'a [u8], &'a [u8])>> {
    let mut out = Vec::new();

    while !buf.is_empty() {
        let key = step(k, &mut buf)?;
        let val = step(v, &mut buf)?;
        out.push((key, val));
    }

    Some(out)
}
