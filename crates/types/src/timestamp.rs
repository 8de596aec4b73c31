//! Timestamps: microseconds since the epoch, stored like an int64 but
//! hashed so that records close in time at the declared granularity land
//! close in the hyperspace.

use std::cmp::Ordering;

use tessera_core::{DataType, TimeUnit};

use crate::{Funcall, FuncName, TypeError};

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

pub fn check_args(unit: TimeUnit, func: &Funcall) -> bool {
    func.name == FuncName::Set
        && func.arg1_type == DataType::Timestamp(unit)
        && validate(&func.arg1)
}

pub fn apply(old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut timestamp = unpack(old_value);

    for func in funcs {
        if func.name != FuncName::Set {
            return Err(TypeError::BadFuncall);
        }

        timestamp = unpack(&func.arg1);
    }

    Ok(pack(timestamp))
}

const INTERVALS: [u64; 6] = [60, 60, 24, 7, 4, 12];

/// Which digit of the decomposition carries the most weight, per unit.
fn table(unit: TimeUnit) -> [usize; 7] {
    match unit {
        TimeUnit::Second => [0, 1, 2, 3, 4, 5, 6],
        TimeUnit::Minute => [1, 0, 2, 3, 4, 5, 6],
        TimeUnit::Hour => [2, 1, 0, 3, 4, 5, 6],
        TimeUnit::Day => [3, 2, 1, 0, 4, 5, 6],
        TimeUnit::Week => [4, 3, 2, 1, 0, 5, 6],
        TimeUnit::Month => [5, 4, 3, 2, 1, 0, 6],
    }
}

/// Decompose the timestamp into (second, minute, hour, day, week, month,
/// rest) digits and weigh them with the unit's digit rotated to the top.
pub fn hash(unit: TimeUnit, value: &[u8]) -> u64 {
    let timestamp = unpack(value) as u64;
    let mut x = (timestamp as f64 / 1_000_000.0) as u64;
    let mut digits = [0u64; 7];

    for (i, interval) in INTERVALS.iter().enumerate() {
        digits[i] = x % interval;
        x /= interval;
    }

    digits[6] = x;

    let table = table(unit);
    let mut y = u64::MAX;
    let mut h = 0u64;

    for i in 0..6 {
        y /= INTERVALS[table[i]];
        h = h.wrapping_add(digits[table[i]].wrapping_mul(y));
    }

    h.wrapping_add(digits[table[6]])
}

pub fn compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    unpack(lhs).cmp(&unpack(rhs))
}
