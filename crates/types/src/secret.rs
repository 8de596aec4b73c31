//! Macaroon secrets: opaque byte strings that can only be replaced.
//! Never hashed, indexed, or placed inside composites.

use tessera_core::DataType;

use crate::{Funcall, FuncName, TypeError};

pub fn validate(_value: &[u8]) -> bool {
    true
}

pub fn check_args(func: &Funcall) -> bool {
    func.name == FuncName::Set && func.arg1_type == DataType::MacaroonSecret
}

pub fn apply(old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut value = old_value.to_vec();

    for func in funcs {
        if func.name != FuncName::Set {
            return Err(TypeError::BadFuncall);
        }

        value = func.arg1.clone();
    }

    Ok(value)
}
