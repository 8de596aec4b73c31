//! Sets of primitives, stored as strictly ascending element sequences.
//! Every operation preserves the sorted invariant.

use std::cmp::Ordering;

use tessera_core::{DataType, Primitive};

use crate::{elem, Funcall, FuncName, TypeError};

pub fn validate(e: Primitive, value: &[u8]) -> bool {
    let Some(items) = elem::decode_all(e, value) else {
        return false;
    };

    items
        .windows(2)
        .all(|w| elem::compare(e, w[0], w[1]) == Ordering::Less)
}

pub fn check_args(e: Primitive, func: &Funcall) -> bool {
    match func.name {
        FuncName::Set | FuncName::SetUnion | FuncName::SetIntersect => {
            func.arg1_type == DataType::Set(e) && validate(e, &func.arg1)
        }
        FuncName::SetAdd | FuncName::SetRemove => {
            func.arg1_type == DataType::from(e) && elem::validate(e, &func.arg1)
        }
        _ => false,
    }
}

fn insert<'a>(e: Primitive, items: &mut Vec<&'a [u8]>, elem: &'a [u8]) {
    match items.binary_search_by(|probe| crate::elem::compare(e, probe, elem)) {
        Ok(_) => {}
        Err(pos) => items.insert(pos, elem),
    }
}

fn remove(e: Primitive, items: &mut Vec<&[u8]>, elem: &[u8]) {
    if let Ok(pos) = items.binary_search_by(|probe| crate::elem::compare(e, probe, elem)) {
        items.remove(pos);
    }
}

fn member(e: Primitive, items: &[&[u8]], elem: &[u8]) -> bool {
    items
        .binary_search_by(|probe| crate::elem::compare(e, probe, elem))
        .is_ok()
}

pub fn apply(e: Primitive, old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut items = elem::decode_all(e, old_value).ok_or(TypeError::MalformedValue)?;

    for func in funcs {
        match func.name {
            FuncName::Set => {
                items = elem::decode_all(e, &func.arg1).ok_or(TypeError::MalformedValue)?;
            }
            FuncName::SetUnion => {
                let arg = elem::decode_all(e, &func.arg1).ok_or(TypeError::MalformedValue)?;

                for item in arg {
                    insert(e, &mut items, item);
                }
            }
            FuncName::SetAdd => insert(e, &mut items, &func.arg1),
            FuncName::SetRemove => remove(e, &mut items, &func.arg1),
            FuncName::SetIntersect => {
                let arg = elem::decode_all(e, &func.arg1).ok_or(TypeError::MalformedValue)?;
                items.retain(|item| member(e, &arg, item));
            }
            _ => return Err(TypeError::BadFuncall),
        }
    }

    let mut out = Vec::new();

    for item in &items {
        elem::write(e, item, &mut out);
    }

    Ok(out)
}

pub fn length(e: Primitive, value: &[u8]) -> Option<u64> {
    elem::decode_all(e, value).map(|items| items.len() as u64)
}

pub fn contains(e: Primitive, value: &[u8], needle: &[u8]) -> Option<bool> {
    let items = elem::decode_all(e, value)?;
    Some(member(e, &items, needle))
}
