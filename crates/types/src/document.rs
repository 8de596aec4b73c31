//! Documents: nested JSON-like trees addressed by dotted paths.
//!
//! A transformer wraps the decoded tree for the duration of one `apply`:
//! it is created from the old bytes, mutated in place, and finalized into
//! the new bytes. Dropping it on an error path releases everything.

use std::cmp::Ordering;

use serde_json::Value;
use tessera_core::{AttributeCheck, DataType, Predicate};

use crate::{float64, int64, Funcall, FuncName, TypeError, TypeInfo};

pub fn validate(value: &[u8]) -> bool {
    if value.is_empty() {
        return true;
    }

    matches!(serde_json::from_slice::<Value>(value), Ok(Value::Object(_)))
}

/// Normalize incoming JSON text to the stored rendering.
pub fn from_wire(value: &[u8]) -> Result<Vec<u8>, TypeError> {
    let parsed: Value =
        serde_json::from_slice(value).map_err(|_| TypeError::MalformedDocument)?;

    if !parsed.is_object() {
        return Err(TypeError::MalformedDocument);
    }

    serde_json::to_vec(&parsed).map_err(|_| TypeError::MalformedDocument)
}

fn is_path(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.contains(&0) {
        return false;
    }

    match std::str::from_utf8(bytes) {
        Ok(path) => path.split('.').all(|seg| !seg.is_empty()),
        Err(_) => false,
    }
}

fn is_primitive(t: DataType) -> bool {
    matches!(t, DataType::String | DataType::Int64 | DataType::Float)
}

pub fn check_args(func: &Funcall) -> bool {
    match func.name {
        FuncName::Set if func.arg1_type == DataType::Document && func.arg2.is_empty() => {
            validate(&func.arg1)
        }
        FuncName::Set | FuncName::ListLpush | FuncName::ListRpush => {
            is_primitive(func.arg1_type) && is_path(&func.arg2)
        }
        FuncName::DocUnset => is_path(&func.arg2),
        FuncName::DocRename => is_path(&func.arg1) && is_path(&func.arg2),
        name if name.is_numeric()
            || matches!(
                name,
                FuncName::StringAppend | FuncName::StringPrepend
            ) =>
        {
            is_path(&func.arg2) && is_primitive(func.arg1_type)
        }
        _ => false,
    }
}

/// Scoped mutable view over one document.
pub struct Transformer {
    root: Value,
}

impl Transformer {
    pub fn new(bytes: &[u8]) -> Result<Self, TypeError> {
        let root = if bytes.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(bytes).map_err(|_| TypeError::MalformedDocument)?
        };

        if !root.is_object() {
            return Err(TypeError::MalformedDocument);
        }

        Ok(Self { root })
    }

    pub fn extract(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;

        for seg in path.split('.') {
            node = node.as_object()?.get(seg)?;
        }

        Some(node)
    }

    /// Write a value at `path`, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), TypeError> {
        let mut node = &mut self.root;
        let segs: Vec<&str> = path.split('.').collect();

        for seg in &segs[..segs.len() - 1] {
            let map = node
                .as_object_mut()
                .ok_or_else(|| TypeError::BadPath(path.to_string()))?;
            node = map
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }

        let map = node
            .as_object_mut()
            .ok_or_else(|| TypeError::BadPath(path.to_string()))?;
        map.insert(segs[segs.len() - 1].to_string(), value);
        Ok(())
    }

    pub fn unset(&mut self, path: &str) -> Result<Value, TypeError> {
        let mut node = &mut self.root;
        let segs: Vec<&str> = path.split('.').collect();

        for seg in &segs[..segs.len() - 1] {
            node = node
                .as_object_mut()
                .and_then(|map| map.get_mut(*seg))
                .ok_or_else(|| TypeError::BadPath(path.to_string()))?;
        }

        node.as_object_mut()
            .and_then(|map| map.remove(segs[segs.len() - 1]))
            .ok_or_else(|| TypeError::BadPath(path.to_string()))
    }

    pub fn rename(&mut self, src: &str, dst: &str) -> Result<(), TypeError> {
        let value = self.unset(src)?;
        self.set(dst, value)
    }

    pub fn array_push(&mut self, path: &str, value: Value, front: bool) -> Result<(), TypeError> {
        if self.extract(path).is_none() {
            self.set(path, Value::Array(Vec::new()))?;
        }

        let mut node = &mut self.root;

        for seg in path.split('.') {
            node = node
                .as_object_mut()
                .and_then(|map| map.get_mut(seg))
                .ok_or_else(|| TypeError::BadPath(path.to_string()))?;
        }

        let array = node.as_array_mut().ok_or(TypeError::TypeMismatch)?;

        if front {
            array.insert(0, value);
        } else {
            array.push(value);
        }

        Ok(())
    }

    pub fn finalize(self) -> Result<Vec<u8>, TypeError> {
        serde_json::to_vec(&self.root).map_err(|_| TypeError::MalformedDocument)
    }
}

fn primitive_to_value(t: DataType, bytes: &[u8]) -> Result<Value, TypeError> {
    match t {
        DataType::String => {
            let s = std::str::from_utf8(bytes).map_err(|_| TypeError::MalformedValue)?;
            Ok(Value::String(s.to_string()))
        }
        DataType::Int64 => Ok(Value::from(int64::unpack(bytes))),
        DataType::Float => serde_json::Number::from_f64(float64::unpack(bytes))
            .map(Value::Number)
            .ok_or(TypeError::MalformedValue),
        _ => Err(TypeError::BadFuncall),
    }
}

fn value_to_primitive(value: &Value) -> Result<(DataType, Vec<u8>), TypeError> {
    match value {
        Value::String(s) => Ok((DataType::String, s.as_bytes().to_vec())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok((DataType::Int64, int64::pack(i)))
            } else {
                let f = n.as_f64().ok_or(TypeError::MalformedValue)?;
                Ok((DataType::Float, float64::pack(f)))
            }
        }
        _ => Err(TypeError::TypeMismatch),
    }
}

fn path_of(bytes: &[u8]) -> Result<&str, TypeError> {
    std::str::from_utf8(bytes).map_err(|_| TypeError::MalformedValue)
}

pub fn apply(old_value: &[u8], funcs: &[Funcall]) -> Result<Vec<u8>, TypeError> {
    let mut tx = Transformer::new(old_value)?;

    for func in funcs {
        match func.name {
            FuncName::Set if func.arg1_type == DataType::Document => {
                tx = Transformer::new(&func.arg1)?;
            }
            FuncName::Set => {
                let path = path_of(&func.arg2)?;
                tx.set(path, primitive_to_value(func.arg1_type, &func.arg1)?)?;
            }
            FuncName::ListLpush | FuncName::ListRpush => {
                let path = path_of(&func.arg2)?;
                let value = primitive_to_value(func.arg1_type, &func.arg1)?;
                tx.array_push(path, value, func.name == FuncName::ListLpush)?;
            }
            FuncName::DocUnset => {
                tx.unset(path_of(&func.arg2)?)?;
            }
            FuncName::DocRename => {
                tx.rename(path_of(&func.arg1)?, path_of(&func.arg2)?)?;
            }
            _ => {
                apply_at_path(&mut tx, func)?;
            }
        }
    }

    tx.finalize()
}

/// Read the primitive at the path, run the funcall through its registry
/// entry, and write the result back. Int64 widens to float when the
/// operand is a float; other mixed pairs must match exactly unless both
/// sides are numeric.
fn apply_at_path(tx: &mut Transformer, func: &Funcall) -> Result<(), TypeError> {
    let path = path_of(&func.arg2)?;

    let (mut stored_type, mut stored) = match tx.extract(path) {
        Some(value) => value_to_primitive(value)?,
        None => (func.arg1_type, Vec::new()),
    };

    if stored_type == DataType::Int64 && func.arg1_type == DataType::Float {
        stored = float64::pack(int64::unpack(&stored) as f64);
        stored_type = DataType::Float;
    }

    let numeral = matches!(stored_type, DataType::Int64 | DataType::Float)
        && matches!(func.arg1_type, DataType::Int64 | DataType::Float);

    if !numeral && stored_type != func.arg1_type {
        return Err(TypeError::TypeMismatch);
    }

    let info = TypeInfo::of(stored_type);

    if !info.check_args(func) {
        return Err(TypeError::BadFuncall);
    }

    let new = info.apply(&stored, std::slice::from_ref(func))?;
    tx.set(path, primitive_to_value(stored_type, &new)?)
}

/// Evaluate a predicate at a path. The check value carries
/// `path \0 comparand`.
pub fn check(doc: &[u8], chk: &AttributeCheck) -> Option<bool> {
    let nul = chk.value.iter().position(|b| *b == 0)?;
    let path = std::str::from_utf8(&chk.value[..nul]).ok()?;
    let comparand = &chk.value[nul + 1..];

    let tx = Transformer::new(doc).ok()?;
    let (found_type, found) = value_to_primitive(tx.extract(path)?).ok()?;

    if found_type != chk.datatype {
        return None;
    }

    let info = TypeInfo::of(found_type);
    let order = info.compare(&found, comparand)?;

    match chk.predicate {
        Predicate::Equals => Some(order == Ordering::Equal),
        Predicate::LessEqual => Some(order != Ordering::Greater),
        Predicate::GreaterEqual => Some(order != Ordering::Less),
        _ => None,
    }
}
