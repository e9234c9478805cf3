//! Index key layout.
//!
//! ```text
//! meta/active                                   -> active generation (decimal)
//! meta/rebuild-lock                             -> {owner, acquired_at}
//! ns/<gen>/info                                 -> {generation, schema_version, sdl}
//! ns/<gen>/doc/<coll>\0<path>                   -> DocumentRecord JSON
//! ns/<gen>/sort/<coll>\0<field>\0<a|d><value><path>  -> path
//! ns/<gen>/ref/<target coll>\0<target path>\0<src coll>\0<src path>\0<field>  -> ""
//! ```
//!
//! `<gen>` is 16 lowercase hex digits so generations sort numerically.

use crate::record::FieldValue;

pub const ACTIVE_KEY: &[u8] = b"meta/active";
pub const LOCK_KEY: &[u8] = b"meta/rebuild-lock";
/// Highest generation number ever handed to a rebuild.
pub const GENERATION_KEY: &[u8] = b"meta/generation";

const SEP: u8 = 0;

const TAG_MISSING: u8 = 0x00;
const TAG_BOOL: u8 = 0x20;
const TAG_NUMBER: u8 = 0x30;
const TAG_STRING: u8 = 0x40;

/// `ns/<gen>/`
pub fn ns_prefix(generation: u64) -> Vec<u8> {
    format!("ns/{generation:016x}/").into_bytes()
}

pub fn info_key(generation: u64) -> Vec<u8> {
    let mut key = ns_prefix(generation);
    key.extend_from_slice(b"info");
    key
}

/// Prefix of every primary record in a collection
pub fn doc_prefix(generation: u64, collection: &str) -> Vec<u8> {
    let mut key = ns_prefix(generation);
    key.extend_from_slice(b"doc/");
    key.extend_from_slice(collection.as_bytes());
    key.push(SEP);
    key
}

pub fn doc_key(generation: u64, collection: &str, path: &str) -> Vec<u8> {
    let mut key = doc_prefix(generation, collection);
    key.extend_from_slice(path.as_bytes());
    key
}

/// Prefix of one sort index. Ascending and descending entries are kept
/// apart so both orders break ties by path ascending.
pub fn sort_prefix(generation: u64, collection: &str, field: &str, descending: bool) -> Vec<u8> {
    let mut key = ns_prefix(generation);
    key.extend_from_slice(b"sort/");
    key.extend_from_slice(collection.as_bytes());
    key.push(SEP);
    key.extend_from_slice(field.as_bytes());
    key.push(SEP);
    key.push(if descending { b'd' } else { b'a' });
    key
}

pub fn sort_key(
    generation: u64,
    collection: &str,
    field: &str,
    descending: bool,
    value: Option<&FieldValue>,
    path: &str,
) -> Vec<u8> {
    let mut key = sort_prefix(generation, collection, field, descending);
    let mut encoded = encode_sort_value(value);
    if descending {
        for byte in &mut encoded {
            *byte = !*byte;
        }
    }
    key.extend_from_slice(&encoded);
    key.extend_from_slice(path.as_bytes());
    key
}

/// Prefix of every back-reference to one target document
pub fn ref_prefix(generation: u64, target_collection: &str, target_path: &str) -> Vec<u8> {
    let mut key = ns_prefix(generation);
    key.extend_from_slice(b"ref/");
    key.extend_from_slice(target_collection.as_bytes());
    key.push(SEP);
    key.extend_from_slice(target_path.as_bytes());
    key.push(SEP);
    key
}

pub fn ref_key(
    generation: u64,
    target_collection: &str,
    target_path: &str,
    source: &RefSource,
) -> Vec<u8> {
    let mut key = ref_prefix(generation, target_collection, target_path);
    key.extend_from_slice(source.collection.as_bytes());
    key.push(SEP);
    key.extend_from_slice(source.path.as_bytes());
    key.push(SEP);
    key.extend_from_slice(source.field.as_bytes());
    key
}

/// The referencing side of a `ref/` entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefSource {
    pub collection: String,
    pub path: String,
    pub field: String,
}

/// Decode the part of a `ref/` key after [`ref_prefix`].
pub fn parse_ref_suffix(suffix: &[u8]) -> Option<RefSource> {
    let mut parts = suffix.splitn(3, |b| *b == SEP);
    let collection = std::str::from_utf8(parts.next()?).ok()?;
    let path = std::str::from_utf8(parts.next()?).ok()?;
    let field = std::str::from_utf8(parts.next()?).ok()?;
    Some(RefSource {
        collection: collection.to_string(),
        path: path.to_string(),
        field: field.to_string(),
    })
}

/// Order-preserving encoding of a sortable scalar. Missing values sort
/// first; every encoding is prefix-free so the path can follow directly.
pub fn encode_sort_value(value: Option<&FieldValue>) -> Vec<u8> {
    match value {
        None => vec![TAG_MISSING],
        Some(FieldValue::Boolean(b)) => vec![TAG_BOOL, u8::from(*b)],
        Some(FieldValue::Number(n)) => {
            let n = if *n == 0.0 { 0.0 } else { *n };
            let bits = n.to_bits();
            let ordered = if n.is_sign_negative() { !bits } else { bits | (1 << 63) };
            let mut out = Vec::with_capacity(9);
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered.to_be_bytes());
            out
        }
        Some(FieldValue::String(s)) | Some(FieldValue::Datetime(s)) => {
            let mut out = Vec::with_capacity(s.len() + 3);
            out.push(TAG_STRING);
            for &byte in s.as_bytes() {
                out.push(byte);
                if byte == 0 {
                    out.push(0xFF);
                }
            }
            out.extend_from_slice(&[0x00, 0x01]);
            out
        }
        // Non-scalar kinds never get sort entries.
        Some(_) => vec![TAG_MISSING],
    }
}

/// Parse a stored `meta/active` or `meta/generation` value.
pub fn parse_generation(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}
