//! Predicate evaluation and index-backed searches.
//!
//! A search constrains any subset of attributes. When some constrained
//! attribute is indexable and carries a bound, the forward index of a
//! subspace that projects it supplies the candidates; everything else
//! falls back to an object scan. All checks are re-verified against the
//! fetched records either way.

use std::cmp::Ordering;

use thiserror::Error;
use tracing::debug;

use tessera_core::ordered::{index_encode_f64, index_encode_i64};
use tessera_core::{
    AttrNum, AttributeCheck, ClusterConfig, DataStore, DataType, IndexRange, Predicate, RegionId,
    Space, SpaceId, StoreError, Version,
};
use tessera_types::{float64, int64, TypeInfo};

use crate::replication::ReplicationManager;
use crate::ChainLink;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("unknown space {0}")]
    UnknownSpace(SpaceId),

    #[error("bad check: {0}")]
    BadCheck(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub key: Vec<u8>,
    pub value: Vec<Vec<u8>>,
    pub version: Version,
}

/// Evaluate one check against a record. The caller guarantees the check
/// passed validation; anything structurally off evaluates to false.
pub fn passes(space: &Space, key: &[u8], value: &[Vec<u8>], check: &AttributeCheck) -> bool {
    let Some(datatype) = space.attr_type(check.attr) else {
        return false;
    };

    let bytes: &[u8] = if check.attr == 0 {
        key
    } else {
        match value.get((check.attr - 1) as usize) {
            Some(bytes) => bytes,
            None => return false,
        }
    };

    let info = TypeInfo::of(datatype);

    // A non-document comparand against a document attribute addresses a
    // path inside the document.
    if info.document() && check.datatype != DataType::Document {
        return info.document_check(bytes, check).unwrap_or(false);
    }

    match check.predicate {
        Predicate::Equals => match info.compare(bytes, &check.value) {
            Some(order) => order == Ordering::Equal,
            None => bytes == check.value.as_slice(),
        },
        Predicate::LessEqual => {
            matches!(info.compare(bytes, &check.value), Some(Ordering::Less | Ordering::Equal))
        }
        Predicate::GreaterEqual => {
            matches!(
                info.compare(bytes, &check.value),
                Some(Ordering::Greater | Ordering::Equal)
            )
        }
        Predicate::Regex => info.regex(&check.value, bytes).unwrap_or(false),
        Predicate::LengthEquals
        | Predicate::LengthLessEqual
        | Predicate::LengthGreaterEqual => {
            let Some(length) = info.length(bytes) else {
                return false;
            };

            let wanted = int64::unpack(&check.value);

            match check.predicate {
                Predicate::LengthEquals => length as i64 == wanted,
                Predicate::LengthLessEqual => length as i64 <= wanted,
                _ => length as i64 >= wanted,
            }
        }
        Predicate::Contains => info.contains(bytes, &check.value).unwrap_or(false),
    }
}

fn validate_check(space: &Space, check: &AttributeCheck) -> Result<(), SearchError> {
    let Some(datatype) = space.attr_type(check.attr) else {
        return Err(SearchError::BadCheck(format!(
            "attribute {} out of range",
            check.attr
        )));
    };

    let info = TypeInfo::of(datatype);

    let ok = match check.predicate {
        Predicate::Equals => true,
        Predicate::LessEqual | Predicate::GreaterEqual => {
            info.comparable() || (info.document() && check.datatype != DataType::Document)
        }
        Predicate::Regex => info.has_regex(),
        Predicate::LengthEquals | Predicate::LengthLessEqual | Predicate::LengthGreaterEqual => {
            info.has_length()
        }
        Predicate::Contains => {
            info.has_contains() && info.contains_datatype() == Some(check.datatype)
        }
    };

    if ok {
        Ok(())
    } else {
        Err(SearchError::BadCheck(format!(
            "predicate {:?} not supported by {datatype}",
            check.predicate
        )))
    }
}

/// Order-preserving image of a comparand, matching the index layout.
fn bound_image(datatype: DataType, value: &[u8]) -> Option<Vec<u8>> {
    match datatype {
        DataType::String => Some(value.to_vec()),
        DataType::Int64 | DataType::Timestamp(_) => {
            Some(index_encode_i64(int64::unpack(value)).to_vec())
        }
        DataType::Float => Some(index_encode_f64(float64::unpack(value)).to_vec()),
        _ => None,
    }
}

fn regions_of(cfg: &ClusterConfig, space: SpaceId, subspace: u16) -> Vec<RegionId> {
    let mut out: Vec<RegionId> = cfg
        .entities
        .keys()
        .map(|e| e.region)
        .filter(|r| r.space == space && r.subspace == subspace)
        .collect();
    out.dedup();
    out
}

impl<S: DataStore, L: ChainLink> ReplicationManager<S, L> {
    /// Run a search over the locally hosted regions of a space.
    ///
    /// `sort_by` orders the results by one comparable attribute,
    /// descending when `maximize` is set.
    pub fn search(
        &self,
        space_id: SpaceId,
        checks: &[AttributeCheck],
        sort_by: Option<(AttrNum, bool)>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let cfg = self.config();
        let space = cfg
            .space(space_id)
            .map_err(|_| SearchError::UnknownSpace(space_id))?;

        for check in checks {
            validate_check(space, check)?;
        }

        // Prefer an indexable bound: any subspace projecting that
        // attribute keeps a forward index for it.
        let plan = checks.iter().find_map(|check| {
            if check.attr == 0 {
                return None;
            }

            let indexable = space
                .attr_type(check.attr)
                .map(|t| TypeInfo::of(t).indexable())
                .unwrap_or(false);

            let ranged = matches!(
                check.predicate,
                Predicate::Equals | Predicate::LessEqual | Predicate::GreaterEqual
            );

            if !indexable || !ranged {
                return None;
            }

            space
                .subspaces
                .iter()
                .position(|su| su.attrs.contains(&check.attr))
                .map(|subspace| (check.attr, subspace as u16))
        });

        let mut results = Vec::new();

        match plan {
            Some((attr, subspace)) => {
                let datatype = space.attr_type(attr).unwrap();
                let mut range = IndexRange::default();

                for check in checks.iter().filter(|c| c.attr == attr) {
                    let Some(image) = bound_image(datatype, &check.value) else {
                        continue;
                    };

                    match check.predicate {
                        Predicate::GreaterEqual => {
                            if range.lower.as_ref().is_none_or(|l| image > *l) {
                                range.lower = Some(image);
                            }
                        }
                        Predicate::LessEqual => {
                            if range.upper.as_ref().is_none_or(|u| image < *u) {
                                range.upper = Some(image);
                            }
                        }
                        Predicate::Equals => {
                            range.lower = Some(image.clone());
                            range.upper = Some(image);
                        }
                        _ => {}
                    }
                }

                debug!(attr, subspace, "searching through the forward index");

                for region in regions_of(&cfg, space_id, subspace) {
                    for key in self.store().scan_index(&region, space, attr, &range)? {
                        let Some((value, version)) = self.store().get(&region, &key)? else {
                            continue;
                        };

                        if checks.iter().all(|c| passes(space, &key, &value, c)) {
                            results.push(SearchResult { key, value, version });
                        }
                    }
                }
            }
            None => {
                debug!("searching by object scan");

                for region in regions_of(&cfg, space_id, 0) {
                    for entry in self.store().scan_objects(&region)? {
                        let Some(value) = entry.value else {
                            continue;
                        };

                        if checks.iter().all(|c| passes(space, &entry.key, &value, c)) {
                            results.push(SearchResult {
                                key: entry.key,
                                value,
                                version: entry.version,
                            });
                        }
                    }
                }
            }
        }

        if let Some((attr, maximize)) = sort_by {
            let datatype = space
                .attr_type(attr)
                .ok_or_else(|| SearchError::BadCheck("sort attribute out of range".into()))?;
            let info = TypeInfo::of(datatype);

            if !info.comparable() {
                return Err(SearchError::BadCheck("sort attribute not comparable".into()));
            }

            results.sort_by(|a, b| {
                let lhs: &[u8] = if attr == 0 { &a.key } else { &a.value[(attr - 1) as usize] };
                let rhs: &[u8] = if attr == 0 { &b.key } else { &b.value[(attr - 1) as usize] };
                let order = info.compare(lhs, rhs).unwrap_or(Ordering::Equal);

                if maximize {
                    order.reverse()
                } else {
                    order
                }
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Attribute, Primitive, Subspace};
    use tessera_types::elem;

    fn space() -> Space {
        Space {
            id: SpaceId(1),
            name: "users".into(),
            attrs: vec![
                Attribute::new("username", DataType::String),
                Attribute::new("name", DataType::String),
                Attribute::new("age", DataType::Int64),
                Attribute::new("tags", DataType::Set(Primitive::String)),
            ],
            subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1, 2])],
            doc_indexes: vec![],
        }
    }

    fn record() -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut tags = Vec::new();
        elem::write(Primitive::String, b"admin", &mut tags);

        (
            b"alice".to_vec(),
            vec![b"Alice".to_vec(), int64::pack(30), tags],
        )
    }

    #[test]
    fn range_checks_compare_numerically() {
        let space = space();
        let (key, value) = record();

        let ge = AttributeCheck::new(2, Predicate::GreaterEqual, DataType::Int64, int64::pack(30));
        let le = AttributeCheck::new(2, Predicate::LessEqual, DataType::Int64, int64::pack(29));
        assert!(passes(&space, &key, &value, &ge));
        assert!(!passes(&space, &key, &value, &le));
    }

    #[test]
    fn regex_applies_to_strings() {
        let space = space();
        let (key, value) = record();

        let re = AttributeCheck::new(1, Predicate::Regex, DataType::String, b"^Al".to_vec());
        assert!(passes(&space, &key, &value, &re));

        assert!(validate_check(&space, &re).is_ok());
        let bad = AttributeCheck::new(2, Predicate::Regex, DataType::Int64, vec![]);
        assert!(validate_check(&space, &bad).is_err());
    }

    #[test]
    fn contains_tests_set_membership() {
        let space = space();
        let (key, value) = record();

        let hit = AttributeCheck::new(3, Predicate::Contains, DataType::String, b"admin".to_vec());
        let miss = AttributeCheck::new(3, Predicate::Contains, DataType::String, b"nobody".to_vec());
        assert!(passes(&space, &key, &value, &hit));
        assert!(!passes(&space, &key, &value, &miss));
    }

    #[test]
    fn length_checks_count_elements() {
        let space = space();
        let (key, value) = record();

        let one = AttributeCheck::new(3, Predicate::LengthEquals, DataType::Int64, int64::pack(1));
        assert!(passes(&space, &key, &value, &one));
    }

    #[test]
    fn key_checks_compare_the_key_itself() {
        let space = space();
        let (key, value) = record();

        let eq = AttributeCheck::new(0, Predicate::Equals, DataType::String, b"alice".to_vec());
        assert!(passes(&space, &key, &value, &eq));
    }
}
