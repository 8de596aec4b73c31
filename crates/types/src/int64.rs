//! Signed 64-bit integers: little-endian on the wire, checked arithmetic
//! in the update algebra, order-preserving image for hashing.

use std::cmp::Ordering;

use tessera_core::{ordered, DataType};

use crate::{float64, Funcall, FuncName, TypeError};

pub fn unpack(value: &[u8]) -> i64 {
    if value.is_empty() {
        return 0;
    }

    let mut buf = [0u8; 8];
    let n = value.len().min(8);
    buf[..n].copy_from_slice(&value[..n]);
    i64::from_le_bytes(buf)
}

pub fn pack(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn validate(value: &[u8]) -> bool {
    value.is_empty() || value.len() == 8
}

/// Interpret a funcall argument as an integer, rounding a float operand.
fn arg(func: &Funcall) -> i64 {
    match func.arg1_type {
        DataType::Int64 => unpack(&func.arg1),
        DataType::Float => float64::unpack(&func.arg1).round() as i64,
        _ => 0,
    }
}

pub fn check_args(func: &Funcall) -> bool {
    let arg_ok = (func.arg1_type == DataType::Int64 && validate(&func.arg1))
        || (func.arg1_type == DataType::Float && float64::validate(&func.arg1));

    arg_ok
        && matches!(
            func.name,
            FuncName::Set
                | FuncName::NumAdd
                | FuncName::NumSub
                | FuncName::NumMul
                | FuncName::NumDiv
                | FuncName::NumMod
                | FuncName::NumAnd
                | FuncName::NumOr
                | FuncName::NumXor
                | FuncName::NumMin
                | FuncName::NumMax
        )
}

pub fn apply(old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut number = unpack(old_value);

    for func in funcs {
        let operand = arg(func);

        number = match func.name {
            FuncName::Set => operand,
            FuncName::NumMin => number.min(operand),
            FuncName::NumMax => number.max(operand),
            FuncName::NumAdd => number.checked_add(operand).ok_or(TypeError::Overflow)?,
            FuncName::NumSub => number.checked_sub(operand).ok_or(TypeError::Overflow)?,
            FuncName::NumMul => number.checked_mul(operand).ok_or(TypeError::Overflow)?,
            FuncName::NumDiv => {
                if operand == 0 {
                    return Err(TypeError::DivideByZero);
                }

                number.checked_div(operand).ok_or(TypeError::Overflow)?
            }
            FuncName::NumMod => {
                if operand == 0 {
                    return Err(TypeError::DivideByZero);
                }

                number.checked_rem(operand).ok_or(TypeError::Overflow)?
            }
            FuncName::NumAnd => number & operand,
            FuncName::NumOr => number | operand,
            FuncName::NumXor => number ^ operand,
            _ => return Err(TypeError::BadFuncall),
        };
    }

    Ok(pack(number))
}

pub fn hash(value: &[u8]) -> u64 {
    ordered::ordered_encode_i64(unpack(value))
}

pub fn compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    unpack(lhs).cmp(&unpack(rhs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(x: i64) -> Funcall {
        Funcall::unary(FuncName::Set, DataType::Int64, pack(x))
    }

    fn num(name: FuncName, x: i64) -> Funcall {
        Funcall::unary(name, DataType::Int64, pack(x))
    }

    #[test]
    fn empty_decodes_as_zero() {
        assert_eq!(unpack(&[]), 0);
    }

    #[test]
    fn apply_runs_funcalls_in_order() {
        let out = apply(
            &pack(10),
            &[num(FuncName::NumAdd, 5), num(FuncName::NumMul, 2)],
        )
        .unwrap();
        assert_eq!(unpack(&out), 30);
    }

    #[test]
    fn apply_with_no_funcalls_is_identity() {
        assert_eq!(apply(&pack(7), &[]).unwrap(), pack(7));
    }

    #[test]
    fn overflow_fails_the_funcall() {
        assert_eq!(
            apply(&pack(i64::MAX), &[num(FuncName::NumAdd, 1)]),
            Err(TypeError::Overflow)
        );
        assert_eq!(
            apply(&pack(i64::MIN), &[num(FuncName::NumDiv, -1)]),
            Err(TypeError::Overflow)
        );
    }

    #[test]
    fn divide_by_zero_fails_the_funcall() {
        assert_eq!(
            apply(&pack(1), &[num(FuncName::NumDiv, 0)]),
            Err(TypeError::DivideByZero)
        );
        assert_eq!(
            apply(&pack(1), &[num(FuncName::NumMod, 0)]),
            Err(TypeError::DivideByZero)
        );
    }

    #[test]
    fn float_arguments_are_rounded() {
        let func = Funcall::unary(FuncName::NumAdd, DataType::Float, float64::pack(2.6));
        assert!(check_args(&func));
        let out = apply(&pack(1), &[func]).unwrap();
        assert_eq!(unpack(&out), 4);
    }

    #[test]
    fn set_replaces_the_value() {
        let out = apply(&pack(5), &[set(-3)]).unwrap();
        assert_eq!(unpack(&out), -3);
    }

    #[test]
    fn hash_preserves_numeric_order() {
        assert!(hash(&pack(i64::MIN)) < hash(&pack(-1)));
        assert!(hash(&pack(-1)) < hash(&pack(0)));
        assert!(hash(&pack(0)) < hash(&pack(i64::MAX)));
    }
}
