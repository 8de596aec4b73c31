//! Atomic update operations.

use tessera_core::DataType;

/// The fixed alphabet of update operations. Composite types interpret
/// the same names recursively: a map applies `NumAdd` to the value
/// stored at the key carried in `arg2`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FuncName {
    Set,
    NumAdd,
    NumSub,
    NumMul,
    NumDiv,
    NumMod,
    NumAnd,
    NumOr,
    NumXor,
    NumMin,
    NumMax,
    StringAppend,
    StringPrepend,
    StringLtrim,
    StringRtrim,
    ListLpush,
    ListRpush,
    SetAdd,
    SetRemove,
    SetIntersect,
    SetUnion,
    MapAdd,
    MapRemove,
    DocUnset,
    DocRename,
    Fail,
}

impl FuncName {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FuncName::NumAdd
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
}

/// One update operation with up to two typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funcall {
    pub name: FuncName,
    pub arg1: Vec<u8>,
    pub arg1_type: DataType,
    pub arg2: Vec<u8>,
    pub arg2_type: DataType,
}

impl Funcall {
    pub fn unary(name: FuncName, arg1_type: DataType, arg1: Vec<u8>) -> Self {
        Self {
            name,
            arg1,
            arg1_type,
            arg2: Vec::new(),
            arg2_type: DataType::String,
        }
    }

    pub fn binary(
        name: FuncName,
        arg1_type: DataType,
        arg1: Vec<u8>,
        arg2_type: DataType,
        arg2: Vec<u8>,
    ) -> Self {
        Self {
            name,
            arg1,
            arg1_type,
            arg2,
            arg2_type,
        }
    }
}
