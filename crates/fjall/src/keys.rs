//! Key and value encoding utilities for fjall storage.
//!
//! All multi-byte integers are encoded as big-endian to ensure correct
//! lexicographic ordering in the LSM tree.
//!
//! ## Key layouts
//!
//! - **Object**: `'o' ++ region_tag[8] ++ raw_key` -> encoded value
//! - **Index (string attr)**: `'i' ++ region_tag[8] ++ attr[2] ++ value
//!   ++ key ++ key_len[4]` (the trailing length permits suffix-agnostic
//!   seeks)
//! - **Index (int64/float/timestamp attr)**: `'i' ++ region_tag[8] ++
//!   attr[2] ++ ordered_image[8] ++ key`
//! - **Index (document path)**: `'i' ++ region_tag[8] ++ attr[2] ++
//!   path_len[2] ++ path ++ ('s'|'i') ++ value ++ key ++ key_len[4]`
//! - **Acked**: `'a' ++ leader_tag[8] ++ seq[8] ++ region_tag[8]` -> `[]`
//!
//! ## Value layout
//!
//! `version[8] ++ n_attrs[2] ++ (attr_len[4] ++ attr_bytes)*`

use tessera_core::ordered::{index_encode_f64, index_encode_i64};
use tessera_core::{DataType, RegionId, Version};
use xxhash_rust::xxh3::xxh3_64;

pub const OBJECT_TAG: u8 = b'o';
pub const INDEX_TAG: u8 = b'i';
pub const ACKED_TAG: u8 = b'a';

/// Size of a region tag: 8-byte u64
pub const REGION_TAG_SIZE: usize = 8;

/// Prefix shared by every index entry of one attribute
pub const INDEX_PREFIX_SIZE: usize = 1 + REGION_TAG_SIZE + 2;

/// Stable 8-byte identity for a region within the store.
pub fn region_tag(region: &RegionId) -> [u8; REGION_TAG_SIZE] {
    xxh3_64(&region.to_bytes()).to_be_bytes()
}

pub fn object_key(region: &RegionId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + REGION_TAG_SIZE + key.len());
    out.push(OBJECT_TAG);
    out.extend_from_slice(&region_tag(region));
    out.extend_from_slice(key);
    out
}

pub fn object_prefix(region: &RegionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + REGION_TAG_SIZE);
    out.push(OBJECT_TAG);
    out.extend_from_slice(&region_tag(region));
    out
}

/// Strip the object prefix back off a stored key.
pub fn decode_object_key<'a>(stored: &'a [u8], region: &RegionId) -> Option<&'a [u8]> {
    let prefix = object_prefix(region);

    if stored.len() < prefix.len() || stored[..prefix.len()] != prefix[..] {
        return None;
    }

    Some(&stored[prefix.len()..])
}

pub fn encode_value(attrs: &[Vec<u8>], version: Version) -> Vec<u8> {
    debug_assert!(attrs.len() < 65536);
    let mut out = Vec::with_capacity(10 + attrs.iter().map(|a| 4 + a.len()).sum::<usize>());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(attrs.len() as u16).to_be_bytes());

    for attr in attrs {
        out.extend_from_slice(&(attr.len() as u32).to_be_bytes());
        out.extend_from_slice(attr);
    }

    out
}

pub fn decode_value(bytes: &[u8]) -> Option<(Vec<Vec<u8>>, Version)> {
    if bytes.len() < 10 {
        return None;
    }

    let version = Version::from_be_bytes(bytes[..8].try_into().unwrap());
    let n_attrs = u16::from_be_bytes(bytes[8..10].try_into().unwrap()) as usize;
    let mut attrs = Vec::with_capacity(n_attrs);
    let mut rest = &bytes[10..];

    for _ in 0..n_attrs {
        if rest.len() < 4 {
            return None;
        }

        let len = u32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;

        if rest.len() < 4 + len {
            return None;
        }

        attrs.push(rest[4..4 + len].to_vec());
        rest = &rest[4 + len..];
    }

    rest.is_empty().then_some((attrs, version))
}

pub fn index_prefix(region: &RegionId, attr: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_PREFIX_SIZE);
    out.push(INDEX_TAG);
    out.extend_from_slice(&region_tag(region));
    out.extend_from_slice(&attr.to_be_bytes());
    out
}

/// Order-preserving image of one attribute value, as it appears inside
/// an index key. Strings pass through raw.
pub fn index_image(datatype: DataType, value: &[u8]) -> Option<Vec<u8>> {
    match datatype {
        DataType::String => Some(value.to_vec()),
        DataType::Int64 | DataType::Timestamp(_) => {
            Some(index_encode_i64(tessera_types::int64::unpack(value)).to_vec())
        }
        DataType::Float => Some(index_encode_f64(tessera_types::float64::unpack(value)).to_vec()),
        _ => None,
    }
}

/// Forward index entry for a primitive attribute. `None` when the type
/// is not indexed.
pub fn index_key(
    region: &RegionId,
    attr: u16,
    datatype: DataType,
    value: &[u8],
    key: &[u8],
) -> Option<Vec<u8>> {
    let image = index_image(datatype, value)?;
    let mut out = index_prefix(region, attr);
    out.extend_from_slice(&image);
    out.extend_from_slice(key);

    if datatype == DataType::String {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    }

    Some(out)
}

/// Recover the record key from an index entry.
pub fn parse_index_key(datatype: DataType, entry: &[u8]) -> Option<Vec<u8>> {
    let body = entry.get(INDEX_PREFIX_SIZE..)?;

    match datatype {
        DataType::String => {
            if body.len() < 4 {
                return None;
            }

            let key_len = u32::from_be_bytes(body[body.len() - 4..].try_into().unwrap()) as usize;
            let end = body.len() - 4;

            if key_len > end {
                return None;
            }

            Some(body[end - key_len..end].to_vec())
        }
        DataType::Int64 | DataType::Float | DataType::Timestamp(_) => {
            (body.len() >= 8).then(|| body[8..].to_vec())
        }
        _ => None,
    }
}

/// Recover the value image from an index entry, for range filtering.
pub fn parse_index_image(datatype: DataType, entry: &[u8]) -> Option<&[u8]> {
    let body = entry.get(INDEX_PREFIX_SIZE..)?;

    match datatype {
        DataType::String => {
            if body.len() < 4 {
                return None;
            }

            let key_len = u32::from_be_bytes(body[body.len() - 4..].try_into().unwrap()) as usize;
            let end = body.len() - 4;

            (key_len <= end).then(|| &body[..end - key_len])
        }
        DataType::Int64 | DataType::Float | DataType::Timestamp(_) => body.get(..8),
        _ => None,
    }
}

/// Index entry for one document path. The value type is explicit: `'s'`
/// for strings, `'i'` for numbers.
pub fn doc_index_key(
    region: &RegionId,
    attr: u16,
    path: &str,
    string_value: Option<&[u8]>,
    number_value: Option<f64>,
    key: &[u8],
) -> Vec<u8> {
    let mut out = index_prefix(region, attr);
    out.extend_from_slice(&(path.len() as u16).to_be_bytes());
    out.extend_from_slice(path.as_bytes());

    match (string_value, number_value) {
        (Some(s), _) => {
            out.push(b's');
            out.extend_from_slice(s);
        }
        (None, Some(n)) => {
            out.push(b'i');
            out.extend_from_slice(&index_encode_f64(n));
        }
        (None, None) => {}
    }

    out.extend_from_slice(key);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out
}

pub fn acked_key(region: &RegionId, leader: &RegionId, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + REGION_TAG_SIZE * 2 + 8);
    out.push(ACKED_TAG);
    out.extend_from_slice(&region_tag(leader));
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&region_tag(region));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SpaceId;
    use tessera_types::{float64, int64};

    fn region() -> RegionId {
        RegionId::new(SpaceId(5), 1, 4, 0xa000_0000_0000_0000)
    }

    #[test]
    fn object_keys_roundtrip() {
        let r = region();
        let stored = object_key(&r, b"alice");
        assert_eq!(stored[0], OBJECT_TAG);
        assert_eq!(decode_object_key(&stored, &r), Some(&b"alice"[..]));

        let other = RegionId::new(SpaceId(5), 1, 4, 0xb000_0000_0000_0000);
        assert_eq!(decode_object_key(&stored, &other), None);
    }

    #[test]
    fn values_roundtrip() {
        let attrs = vec![b"Alice".to_vec(), int64::pack(30)];
        let encoded = encode_value(&attrs, 7);
        assert_eq!(decode_value(&encoded), Some((attrs, 7)));
    }

    #[test]
    fn empty_attr_vectors_roundtrip() {
        let encoded = encode_value(&[], 1);
        assert_eq!(decode_value(&encoded), Some((vec![], 1)));
    }

    #[test]
    fn truncated_values_are_rejected() {
        let encoded = encode_value(&[b"x".to_vec()], 1);
        assert_eq!(decode_value(&encoded[..encoded.len() - 1]), None);
    }

    #[test]
    fn int64_index_keys_sort_numerically() {
        let r = region();
        let lo = index_key(&r, 2, DataType::Int64, &int64::pack(-5), b"k").unwrap();
        let hi = index_key(&r, 2, DataType::Int64, &int64::pack(5), b"k").unwrap();
        assert!(lo < hi);
        assert_eq!(parse_index_key(DataType::Int64, &lo), Some(b"k".to_vec()));
    }

    #[test]
    fn float_index_keys_sort_numerically() {
        let r = region();
        let lo = index_key(&r, 2, DataType::Float, &float64::pack(-0.5), b"k").unwrap();
        let hi = index_key(&r, 2, DataType::Float, &float64::pack(1.5), b"k").unwrap();
        assert!(lo < hi);
    }

    #[test]
    fn string_index_keys_carry_a_trailing_length() {
        let r = region();
        let entry = index_key(&r, 1, DataType::String, b"Alice", b"alice").unwrap();
        assert_eq!(
            parse_index_key(DataType::String, &entry),
            Some(b"alice".to_vec())
        );
        assert_eq!(
            parse_index_image(DataType::String, &entry),
            Some(&b"Alice"[..])
        );
    }

    #[test]
    fn composite_attrs_are_not_indexed() {
        let r = region();
        let t = DataType::List(tessera_core::Primitive::Int64);
        assert!(index_key(&r, 1, t, b"", b"k").is_none());
    }

    #[test]
    fn doc_index_type_byte_is_explicit() {
        let r = region();
        let s = doc_index_key(&r, 1, "user.name", Some(b"x"), None, b"k");
        let n = doc_index_key(&r, 1, "user.name", None, Some(1.0), b"k");

        let path_end = INDEX_PREFIX_SIZE + 2 + "user.name".len();
        assert_eq!(s[path_end], b's');
        assert_eq!(n[path_end], b'i');
    }
}
