//! Space schemas and search predicates.

use serde::{Deserialize, Serialize};

use crate::{AttrNum, DataType, SpaceId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub datatype: DataType,
}

impl Attribute {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            datatype,
        }
    }
}

/// The subset of attributes a subspace hashes on. Attribute numbers refer
/// to the space's attribute list; 0 is the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subspace {
    pub attrs: Vec<AttrNum>,
}

impl Subspace {
    pub fn new(attrs: Vec<AttrNum>) -> Self {
        Self { attrs }
    }
}

/// A secondary index over one path inside a document attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocIndex {
    pub attr: AttrNum,
    pub path: String,
}

/// A named schema: one key attribute plus N typed value attributes,
/// partitioned into one or more subspaces. Subspace 0 always hashes the
/// key alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub subspaces: Vec<Subspace>,
    #[serde(default)]
    pub doc_indexes: Vec<DocIndex>,
}

impl Space {
    /// Number of attributes, key included.
    pub fn dimensionality(&self) -> usize {
        self.attrs.len()
    }

    pub fn key_type(&self) -> DataType {
        self.attrs[0].datatype
    }

    pub fn attr_type(&self, attr: AttrNum) -> Option<DataType> {
        self.attrs.get(attr as usize).map(|a| a.datatype)
    }

    pub fn attr_by_name(&self, name: &str) -> Option<AttrNum> {
        self.attrs
            .iter()
            .position(|a| a.name == name)
            .map(|i| i as AttrNum)
    }

    /// Dimension selector for one subspace: `dims[i]` is true iff
    /// attribute `i` participates in the subspace's point.
    pub fn dimensions(&self, subspace: u16) -> Option<Vec<bool>> {
        let su = self.subspaces.get(subspace as usize)?;
        let mut dims = vec![false; self.attrs.len()];

        for attr in &su.attrs {
            if let Some(slot) = dims.get_mut(*attr as usize) {
                *slot = true;
            }
        }

        Some(dims)
    }
}

/// Comparison predicates usable in searches and conditional writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Equals,
    LessEqual,
    GreaterEqual,
    Regex,
    LengthEquals,
    LengthLessEqual,
    LengthGreaterEqual,
    Contains,
}

/// One predicate applied to one attribute. A range check is expressed as
/// a `GreaterEqual` and a `LessEqual` on the same attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeCheck {
    pub attr: AttrNum,
    pub value: Vec<u8>,
    pub datatype: DataType,
    pub predicate: Predicate,
}

impl AttributeCheck {
    pub fn new(attr: AttrNum, predicate: Predicate, datatype: DataType, value: Vec<u8>) -> Self {
        Self {
            attr,
            value,
            datatype,
            predicate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Space {
        Space {
            id: SpaceId(7),
            name: "users".into(),
            attrs: vec![
                Attribute::new("username", DataType::String),
                Attribute::new("name", DataType::String),
                Attribute::new("age", DataType::Int64),
            ],
            subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1, 2])],
            doc_indexes: vec![],
        }
    }

    #[test]
    fn dimensions_select_subspace_attrs() {
        let space = users();
        assert_eq!(space.dimensions(0), Some(vec![true, false, false]));
        assert_eq!(space.dimensions(1), Some(vec![false, true, true]));
        assert_eq!(space.dimensions(2), None);
    }

    #[test]
    fn attr_lookup_by_name() {
        let space = users();
        assert_eq!(space.attr_by_name("age"), Some(2));
        assert_eq!(space.attr_by_name("missing"), None);
        assert_eq!(space.attr_type(2), Some(DataType::Int64));
    }
}
