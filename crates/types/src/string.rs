//! Byte strings: raw on the wire, length-prefixed inside composites.

use std::cmp::Ordering;

use tessera_core::DataType;
use xxhash_rust::xxh3::xxh3_64;

use crate::{int64, Funcall, FuncName, TypeError};

pub fn validate(_value: &[u8]) -> bool {
    true
}

pub fn check_args(func: &Funcall) -> bool {
    match func.name {
        FuncName::Set | FuncName::StringPrepend | FuncName::StringAppend => {
            func.arg1_type == DataType::String
        }
        FuncName::StringLtrim | FuncName::StringRtrim => {
            func.arg1_type == DataType::Int64
                && int64::validate(&func.arg1)
                && int64::unpack(&func.arg1) >= 0
        }
        _ => false,
    }
}

pub fn apply(old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut value = old_value.to_vec();

    for func in funcs {
        match func.name {
            FuncName::Set => {
                value.clear();
                value.extend_from_slice(&func.arg1);
            }
            FuncName::StringPrepend => {
                let mut prefixed = func.arg1.clone();
                prefixed.extend_from_slice(&value);
                value = prefixed;
            }
            FuncName::StringAppend => value.extend_from_slice(&func.arg1),
            FuncName::StringLtrim => {
                let n = (int64::unpack(&func.arg1) as usize).min(value.len());
                value.drain(..n);
            }
            FuncName::StringRtrim => {
                let n = (int64::unpack(&func.arg1) as usize).min(value.len());
                value.truncate(value.len() - n);
            }
            _ => return Err(TypeError::BadFuncall),
        }
    }

    Ok(value)
}

pub fn hash(value: &[u8]) -> u64 {
    xxh3_64(value)
}

pub fn compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

pub fn regex_match(pattern: &[u8], value: &[u8]) -> bool {
    let Ok(pattern) = std::str::from_utf8(pattern) else {
        return false;
    };

    match regex::bytes::Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Element codec inside composites: 4-byte little-endian length prefix.
pub fn step<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.len() < 4 {
        return None;
    }

    let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;

    if buf.len() < 4 + len {
        return None;
    }

    let elem = &buf[4..4 + len];
    *buf = &buf[4 + len..];
    Some(elem)
}

pub fn write_elem(elem: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(elem.len() as u32).to_le_bytes());
    out.extend_from_slice(elem);
}
