//! Maps from one primitive to another, stored as strictly ascending
//! key/value sequences.
//!
//! Funcalls other than the map-level ones are forwarded to the value
//! type at the key carried in `arg2`; a missing key behaves as the value
//! type's identity.

use std::cmp::Ordering;

use tessera_core::{DataType, Primitive};

use crate::{elem, Funcall, FuncName, TypeError};

pub fn validate(k: Primitive, v: Primitive, value: &[u8]) -> bool {
    let Some(pairs) = elem::decode_pairs(k, v, value) else {
        return false;
    };

    pairs
        .windows(2)
        .all(|w| elem::compare(k, w[0].0, w[1].0) == Ordering::Less)
}

pub fn check_args(k: Primitive, v: Primitive, func: &Funcall) -> bool {
    match func.name {
        FuncName::Set => {
            func.arg1_type == DataType::Map(k, v) && validate(k, v, &func.arg1)
        }
        FuncName::MapAdd => {
            func.arg1_type == DataType::from(v)
                && elem::validate(v, &func.arg1)
                && func.arg2_type == DataType::from(k)
                && elem::validate(k, &func.arg2)
        }
        FuncName::MapRemove => {
            func.arg1_type == DataType::from(k) && elem::validate(k, &func.arg1)
        }
        name if name.is_numeric()
            || matches!(name, FuncName::StringAppend | FuncName::StringPrepend) =>
        {
            func.arg2_type == DataType::from(k)
                && elem::validate(k, &func.arg2)
                && crate::TypeInfo::of(DataType::from(v)).check_args(func)
        }
        _ => false,
    }
}

type Entries = Vec<(Vec<u8>, Vec<u8>)>;

fn position(k: Primitive, entries: &Entries, key: &[u8]) -> Result<usize, usize> {
    entries.binary_search_by(|probe| elem::compare(k, &probe.0, key))
}

fn upsert(k: Primitive, entries: &mut Entries, key: &[u8], value: Vec<u8>) {
    match position(k, entries, key) {
        Ok(pos) => entries[pos].1 = value,
        Err(pos) => entries.insert(pos, (key.to_vec(), value)),
    }
}

fn decode(k: Primitive, v: Primitive, value: &[u8]) -> Result<Entries, TypeError> {
    let pairs = elem::decode_pairs(k, v, value).ok_or(TypeError::MalformedValue)?;

    Ok(pairs
        .into_iter()
        .map(|(key, val)| (key.to_vec(), val.to_vec()))
        .collect())
}

pub fn apply(
    k: Primitive,
    v: Primitive,
    old_value: &[u8],
    funcs: &[Funcall],
) -> Result<Vec<u8>, TypeError> {
    let mut entries = decode(k, v, old_value)?;

    for func in funcs {
        match func.name {
            FuncName::Set => entries = decode(k, v, &func.arg1)?,
            FuncName::MapAdd => upsert(k, &mut entries, &func.arg2, func.arg1.clone()),
            FuncName::MapRemove => {
                if let Ok(pos) = position(k, &entries, &func.arg1) {
                    entries.remove(pos);
                }
            }
            name if name.is_numeric()
                || matches!(name, FuncName::StringAppend | FuncName::StringPrepend) =>
            {
                let old = match position(k, &entries, &func.arg2) {
                    Ok(pos) => entries[pos].1.clone(),
                    Err(_) => Vec::new(),
                };

                let info = crate::TypeInfo::of(DataType::from(v));
                let new = info.apply(&old, std::slice::from_ref(func))?;
                upsert(k, &mut entries, &func.arg2, new);
            }
            _ => return Err(TypeError::BadFuncall),
        }
    }

    let mut out = Vec::new();

    for (key, val) in &entries {
        elem::write(k, key, &mut out);
        elem::write(v, val, &mut out);
    }

    Ok(out)
}

pub fn length(k: Primitive, v: Primitive, value: &[u8]) -> Option<u64> {
    elem::decode_pairs(k, v, value).map(|pairs| pairs.len() as u64)
}

/// Membership tests the keys, mirroring `contains_datatype`.
pub fn contains(k: Primitive, v: Primitive, value: &[u8], needle: &[u8]) -> Option<bool> {
    let pairs = elem::decode_pairs(k, v, value)?;
    Some(pairs.iter().any(|(key, _)| *key == needle))
}
