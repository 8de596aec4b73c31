//! The attribute type registry: validation, the funcall update algebra,
//! hashing, comparison, and element codecs for every supported type.
//!
//! Behavior hangs off the plain [`DataType`] tag through [`TypeInfo`], a
//! copyable handle whose methods dispatch by match. Capabilities that a
//! type lacks surface as `None`, never as a panic.

use std::cmp::Ordering;

use thiserror::Error;
use tessera_core::{AttributeCheck, DataType, Primitive};

pub mod document;
pub mod elem;
pub mod float64;
pub mod funcall;
pub mod hyperspace;
pub mod int64;
pub mod list;
pub mod map;
pub mod secret;
pub mod set;
pub mod string;
pub mod timestamp;

pub use funcall::{FuncName, Funcall};
pub use hyperspace::point_hashes;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("arithmetic overflow")]
    Overflow,

    #[error("division by zero")]
    DivideByZero,

    #[error("funcall not applicable to this type")]
    BadFuncall,

    #[error("malformed value")]
    MalformedValue,

    #[error("document is not a json object")]
    MalformedDocument,

    #[error("no value at document path {0}")]
    BadPath(String),

    #[error("mismatched types at document path")]
    TypeMismatch,
}

/// Registry handle for one attribute type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    datatype: DataType,
}

impl TypeInfo {
    pub fn of(datatype: DataType) -> Self {
        Self { datatype }
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Pure structural validation of a stored value.
    pub fn validate(&self, value: &[u8]) -> bool {
        match self.datatype {
            DataType::String => string::validate(value),
            DataType::Int64 => int64::validate(value),
            DataType::Float => float64::validate(value),
            DataType::Document => document::validate(value),
            DataType::Timestamp(_) => timestamp::validate(value),
            DataType::MacaroonSecret => secret::validate(value),
            DataType::List(e) => list::validate(e, value),
            DataType::Set(e) => set::validate(e, value),
            DataType::Map(k, v) => map::validate(k, v, value),
        }
    }

    /// Whether a funcall's name and argument types fit this type. A
    /// funcall that fails here must never reach `apply`.
    pub fn check_args(&self, func: &Funcall) -> bool {
        if func.name == FuncName::Fail {
            return false;
        }

        match self.datatype {
            DataType::String => string::check_args(func),
            DataType::Int64 => int64::check_args(func),
            DataType::Float => float64::check_args(func),
            DataType::Document => document::check_args(func),
            DataType::Timestamp(unit) => timestamp::check_args(unit, func),
            DataType::MacaroonSecret => secret::check_args(func),
            DataType::List(e) => list::check_args(e, func),
            DataType::Set(e) => set::check_args(e, func),
            DataType::Map(k, v) => map::check_args(k, v, func),
        }
    }

    /// Deterministically fold the funcalls over the old value. Failure
    /// aborts the whole mutation; no partial result escapes.
    pub fn apply(&self, old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
        match self.datatype {
            DataType::String => string::apply(old_value, funcs),
            DataType::Int64 => int64::apply(old_value, funcs),
            DataType::Float => float64::apply(old_value, funcs),
            DataType::Document => document::apply(old_value, funcs),
            DataType::Timestamp(_) => timestamp::apply(old_value, funcs),
            DataType::MacaroonSecret => secret::apply(old_value, funcs),
            DataType::List(e) => list::apply(e, old_value, funcs),
            DataType::Set(e) => set::apply(e, old_value, funcs),
            DataType::Map(k, v) => map::apply(k, v, old_value, funcs),
        }
    }

    pub fn hashable(&self) -> bool {
        matches!(
            self.datatype,
            DataType::String | DataType::Int64 | DataType::Float | DataType::Timestamp(_)
        )
    }

    pub fn hash(&self, value: &[u8]) -> Option<u64> {
        match self.datatype {
            DataType::String => Some(string::hash(value)),
            DataType::Int64 => Some(int64::hash(value)),
            DataType::Float => Some(float64::hash(value)),
            DataType::Timestamp(unit) => Some(timestamp::hash(unit, value)),
            _ => None,
        }
    }

    pub fn indexable(&self) -> bool {
        matches!(
            self.datatype,
            DataType::String | DataType::Int64 | DataType::Float | DataType::Timestamp(_)
        )
    }

    pub fn has_length(&self) -> bool {
        matches!(
            self.datatype,
            DataType::String | DataType::List(_) | DataType::Set(_) | DataType::Map(..)
        )
    }

    pub fn length(&self, value: &[u8]) -> Option<u64> {
        match self.datatype {
            DataType::String => Some(value.len() as u64),
            DataType::List(e) => list::length(e, value),
            DataType::Set(e) => set::length(e, value),
            DataType::Map(k, v) => map::length(k, v, value),
            _ => None,
        }
    }

    pub fn has_regex(&self) -> bool {
        self.datatype == DataType::String
    }

    pub fn regex(&self, pattern: &[u8], value: &[u8]) -> Option<bool> {
        match self.datatype {
            DataType::String => Some(string::regex_match(pattern, value)),
            _ => None,
        }
    }

    pub fn has_contains(&self) -> bool {
        matches!(
            self.datatype,
            DataType::List(_) | DataType::Set(_) | DataType::Map(..)
        )
    }

    /// The type a `Contains` needle must carry.
    pub fn contains_datatype(&self) -> Option<DataType> {
        match self.datatype {
            DataType::List(e) | DataType::Set(e) => Some(e.into()),
            DataType::Map(k, _) => Some(k.into()),
            _ => None,
        }
    }

    pub fn contains(&self, value: &[u8], needle: &[u8]) -> Option<bool> {
        match self.datatype {
            DataType::List(e) => list::contains(e, value, needle),
            DataType::Set(e) => set::contains(e, value, needle),
            DataType::Map(k, v) => map::contains(k, v, value, needle),
            _ => None,
        }
    }

    /// Whether the type may appear inside a composite.
    pub fn containable(&self) -> bool {
        matches!(
            self.datatype,
            DataType::String | DataType::Int64 | DataType::Float | DataType::Timestamp(_)
        )
    }

    pub fn comparable(&self) -> bool {
        matches!(
            self.datatype,
            DataType::String | DataType::Int64 | DataType::Float | DataType::Timestamp(_)
        )
    }

    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Option<Ordering> {
        match self.datatype {
            DataType::String => Some(string::compare(lhs, rhs)),
            DataType::Int64 => Some(int64::compare(lhs, rhs)),
            DataType::Float => Some(float64::compare(lhs, rhs)),
            DataType::Timestamp(_) => Some(timestamp::compare(lhs, rhs)),
            _ => None,
        }
    }

    pub fn document(&self) -> bool {
        self.datatype == DataType::Document
    }

    /// Evaluate a path check against a stored document.
    pub fn document_check(&self, value: &[u8], check: &AttributeCheck) -> Option<bool> {
        match self.datatype {
            DataType::Document => document::check(value, check),
            _ => None,
        }
    }

    /// Lazily decode the elements of a composite payload. Only valid for
    /// the containable primitives.
    pub fn elements<'a>(&self, buf: &'a [u8]) -> Option<ElementIter<'a>> {
        let p = match self.datatype {
            DataType::String => Primitive::String,
            DataType::Int64 => Primitive::Int64,
            DataType::Float => Primitive::Float,
            DataType::Timestamp(_) => Primitive::Int64,
            _ => return None,
        };

        Some(ElementIter { p, buf, poisoned: false })
    }
}

/// Finite, non-restartable pass over an encoded element sequence. A
/// malformed tail yields one `Err` and then ends.
pub struct ElementIter<'a> {
    p: Primitive,
    buf: &'a [u8],
    poisoned: bool,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<&'a [u8], TypeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.buf.is_empty() {
            return None;
        }

        match elem::step(self.p, &mut self.buf) {
            Some(item) => Some(Ok(item)),
            None => {
                self.poisoned = true;
                Some(Err(TypeError::MalformedValue))
            }
        }
    }
}
