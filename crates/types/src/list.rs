//! Lists of primitives. Order is insertion order; pushes splice at the
//! ends.

use std::collections::VecDeque;

use tessera_core::{DataType, Primitive};

use crate::{elem, Funcall, FuncName, TypeError};

pub fn validate(e: Primitive, value: &[u8]) -> bool {
    elem::decode_all(e, value).is_some()
}

pub fn check_args(e: Primitive, func: &Funcall) -> bool {
    match func.name {
        FuncName::Set => func.arg1_type == DataType::List(e) && validate(e, &func.arg1),
        FuncName::ListLpush | FuncName::ListRpush => {
            func.arg1_type == DataType::from(e) && elem::validate(e, &func.arg1)
        }
        _ => false,
    }
}

pub fn apply(e: Primitive, old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut list: VecDeque<&[u8]> = elem::decode_all(e, old_value)
        .ok_or(TypeError::MalformedValue)?
        .into();

    for func in funcs {
        match func.name {
            FuncName::Set => {
                list = elem::decode_all(e, &func.arg1)
                    .ok_or(TypeError::MalformedValue)?
                    .into();
            }
            FuncName::ListLpush => list.push_front(&func.arg1),
            FuncName::ListRpush => list.push_back(&func.arg1),
            _ => return Err(TypeError::BadFuncall),
        }
    }

    let mut out = Vec::new();

    for item in &list {
        elem::write(e, item, &mut out);
    }

    Ok(out)
}

pub fn length(e: Primitive, value: &[u8]) -> Option<u64> {
    elem::decode_all(e, value).map(|items| items.len() as u64)
}

pub fn contains(e: Primitive, value: &[u8], needle: &[u8]) -> Option<bool> {
    let items = elem::decode_all(e, value)?;
    Some(items.iter().any(|item| *item == needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::int64;

    fn encode(e: Primitive, items: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for item in items {
            elem::write(e, item, &mut out);
        }
        out
    }

    #[test]
    fn pushes_splice_at_the_ends() {
        let old = encode(Primitive::Int64, &[&int64::pack(2)]);
        let out = apply(
            Primitive::Int64,
            &old,
            &[
                Funcall::unary(FuncName::ListRpush, DataType::Int64, int64::pack(3)),
                Funcall::unary(FuncName::ListLpush, DataType::Int64, int64::pack(1)),
            ],
        )
        .unwrap();

        let items = elem::decode_all(Primitive::Int64, &out).unwrap();
        let nums: Vec<i64> = items.iter().map(|i| int64::unpack(i)).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn validate_rejects_ragged_payloads() {
        assert!(!validate(Primitive::Int64, &[1, 2, 3]));
        assert!(validate(Primitive::Int64, &int64::pack(1)));
    }

    #[test]
    fn string_lists_roundtrip() {
        let old = encode(Primitive::String, &[b"a", b"bb"]);
        let out = apply(
            Primitive::String,
            &old,
            &[Funcall::unary(
                FuncName::ListRpush,
                DataType::String,
                b"ccc".to_vec(),
            )],
        )
        .unwrap();
        assert_eq!(
            elem::decode_all(Primitive::String, &out).unwrap(),
            vec![&b"a"[..], &b"bb"[..], &b"ccc"[..]]
        );
        assert_eq!(length(Primitive::String, &out), Some(3));
        assert_eq!(contains(Primitive::String, &out, b"bb"), Some(true));
        assert_eq!(contains(Primitive::String, &out, b"zz"), Some(false));
    }
}
