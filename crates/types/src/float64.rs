//! IEEE 754 doubles: little-endian on the wire, total-order image for
//! hashing and indexing.

use std::cmp::Ordering;

use tessera_core::{ordered, DataType};

use crate::{int64, Funcall, FuncName, TypeError};

pub fn unpack(value: &[u8]) -> f64 {
    if value.is_empty() {
        return 0.0;
    }

    let mut buf = [0u8; 8];
    let n = value.len().min(8);
    buf[..n].copy_from_slice(&value[..n]);
    f64::from_le_bytes(buf)
}

pub fn pack(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn validate(value: &[u8]) -> bool {
    value.is_empty() || value.len() == 8
}

fn arg(func: &Funcall) -> f64 {
    match func.arg1_type {
        DataType::Float => unpack(&func.arg1),
        DataType::Int64 => int64::unpack(&func.arg1) as f64,
        _ => 0.0,
    }
}

pub fn check_args(func: &Funcall) -> bool {
    let arg_ok = (func.arg1_type == DataType::Float && validate(&func.arg1))
        || (func.arg1_type == DataType::Int64 && int64::validate(&func.arg1));

    arg_ok
        && matches!(
            func.name,
            FuncName::Set
                | FuncName::NumAdd
                | FuncName::NumSub
                | FuncName::NumMul
                | FuncName::NumDiv
                | FuncName::NumMod
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
            FuncName::NumAdd => number + operand,
            FuncName::NumSub => number - operand,
            FuncName::NumMul => number * operand,
            FuncName::NumDiv => {
                if operand == 0.0 {
                    return Err(TypeError::DivideByZero);
                }

                number / operand
            }
            FuncName::NumMod => {
                if operand == 0.0 {
                    return Err(TypeError::DivideByZero);
                }

                number % operand
            }
            _ => return Err(TypeError::BadFuncall),
        };
    }

    Ok(pack(number))
}

pub fn hash(value: &[u8]) -> u64 {
    ordered::ordered_encode_f64(unpack(value))
}

pub fn compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    // Total order through the index image so that NaN and the zeroes
    // compare the same way everywhere.
    hash(lhs).cmp(&hash(rhs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(name: FuncName, x: f64) -> Funcall {
        Funcall::unary(name, DataType::Float, pack(x))
    }

    #[test]
    fn apply_is_plain_ieee_arithmetic() {
        let out = apply(&pack(1.5), &[num(FuncName::NumAdd, 2.25)]).unwrap();
        assert_eq!(unpack(&out), 3.75);
    }

    #[test]
    fn divide_by_zero_fails() {
        assert_eq!(
            apply(&pack(1.0), &[num(FuncName::NumDiv, 0.0)]),
            Err(TypeError::DivideByZero)
        );
    }

    #[test]
    fn int_arguments_coerce() {
        let func = Funcall::unary(FuncName::NumMax, DataType::Int64, int64::pack(9));
        assert!(check_args(&func));
        let out = apply(&pack(1.0), &[func]).unwrap();
        assert_eq!(unpack(&out), 9.0);
    }

    #[test]
    fn zeroes_compare_equal() {
        assert_eq!(compare(&pack(0.0), &pack(-0.0)), Ordering::Equal);
    }

    #[test]
    fn nan_sorts_last() {
        assert_eq!(compare(&pack(f64::NAN), &pack(f64::INFINITY)), Ordering::Greater);
    }
}
