//! Key and entry encoding shared by the memtable, miniruns and the leaf
//! index.
//!
//! An internal key is the user key followed by an 8-byte tag packing the
//! sequence number and the value type: `tag = (seq << 8) | type`. Internal
//! keys order by user key ascending, then tag descending, so the most
//! recent version of a user key sorts first.
//!
//! A PM entry is the concatenation of:
//!
//! ```text
//! [varint32 internal_key_len][internal_key][varint32 value_len][value]
//! ```

use std::cmp::Ordering;

use crate::error::Result;

/// Number of bytes in the sequence+type tag.
pub const TAG_LEN: usize = 8;

/// Highest sequence number the tag encoding can carry.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

pub type SequenceNumber = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl ValueType {
    pub fn from_tag(tag: u64) -> Result<ValueType> {
        match (tag & 0xff) as u8 {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => errcorruption!("unknown value type {other} in tag"),
        }
    }
}

/// Packs a sequence number and value type into a tag.
pub fn pack_tag(seq: SequenceNumber, vtype: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | vtype as u64
}

/// Appends `user_key` plus its tag to `buf`, forming an internal key.
pub fn append_internal_key(buf: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, vtype: ValueType) {
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_tag(seq, vtype).to_le_bytes());
}

/// Builds an internal key suitable for seeking: for a given `(user_key,
/// seq)` it sorts before every version of the key with a sequence number
/// ≤ `seq` and after every newer version.
pub fn seek_key(user_key: &[u8], seq: SequenceNumber) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
    append_internal_key(&mut buf, user_key, seq, ValueType::Value);
    buf
}

/// A borrowed, decoded view of an internal key.
#[derive(Debug, Clone, Copy)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub vtype: ValueType,
}

/// Splits an internal key into its user key and tag parts. Fails with
/// `Corruption` on a short key or an unknown value type.
pub fn parse_internal_key(key: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if key.len() < TAG_LEN {
        return errcorruption!("internal key too short: {} bytes", key.len());
    }
    let (user_key, tag_bytes) = key.split_at(key.len() - TAG_LEN);
    let tag = u64::from_le_bytes(tag_bytes.try_into().unwrap());
    Ok(ParsedInternalKey {
        user_key,
        sequence: tag >> 8,
        vtype: ValueType::from_tag(tag)?,
    })
}

/// The user-key prefix of an internal key. The key must carry a tag.
pub fn user_key(key: &[u8]) -> &[u8] {
    debug_assert!(key.len() >= TAG_LEN);
    &key[..key.len() - TAG_LEN]
}

/// Raw tag of an internal key.
pub fn tag_of(key: &[u8]) -> u64 {
    debug_assert!(key.len() >= TAG_LEN);
    u64::from_le_bytes(key[key.len() - TAG_LEN..].try_into().unwrap())
}

/// Orders internal keys: user key ascending, tag descending. Keys shorter
/// than a tag compare as bare user keys, which only happens in tests.
pub fn compare_internal_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() < TAG_LEN || b.len() < TAG_LEN {
        return a.cmp(b);
    }
    match user_key(a).cmp(user_key(b)) {
        Ordering::Equal => tag_of(b).cmp(&tag_of(a)),
        other => other,
    }
}

/// Appends a varint32 to `buf`.
pub fn put_varint32(buf: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decodes a varint32 from the front of `data`, returning the value and the
/// number of bytes consumed.
pub fn get_varint32(data: &[u8]) -> Result<(u32, usize)> {
    let mut result: u32 = 0;
    for (i, &byte) in data.iter().take(5).enumerate() {
        result |= ((byte & 0x7f) as u32) << (i * 7);
        if byte < 0x80 {
            return Ok((result, i + 1));
        }
    }
    errcorruption!("truncated or overlong varint32")
}

/// Number of bytes `put_varint32` emits for `v`.
pub fn varint32_length(v: u32) -> usize {
    let mut len = 1;
    let mut v = v;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// A decoded PM entry borrowed from a sub-arena.
#[derive(Debug, Clone, Copy)]
pub struct PmEntry<'a> {
    pub internal_key: &'a [u8],
    pub value: &'a [u8],
    /// Total encoded length of the entry.
    pub encoded_len: usize,
}

/// Encodes a PM entry: length-prefixed internal key, then length-prefixed
/// value. Returns the encoded bytes.
pub fn encode_pm_entry(
    user_key: &[u8],
    seq: SequenceNumber,
    vtype: ValueType,
    value: &[u8],
) -> Vec<u8> {
    let ikey_len = user_key.len() + TAG_LEN;
    let mut buf = Vec::with_capacity(
        varint32_length(ikey_len as u32) + ikey_len + varint32_length(value.len() as u32) + value.len(),
    );
    put_varint32(&mut buf, ikey_len as u32);
    append_internal_key(&mut buf, user_key, seq, vtype);
    put_varint32(&mut buf, value.len() as u32);
    buf.extend_from_slice(value);
    buf
}

/// Decodes a PM entry from the front of `data`. Fails with `Corruption` if
/// the slice is shorter than the lengths it declares.
pub fn decode_pm_entry(data: &[u8]) -> Result<PmEntry<'_>> {
    let (klen, koff) = get_varint32(data)?;
    let klen = klen as usize;
    if klen < TAG_LEN || koff + klen > data.len() {
        return errcorruption!("pm entry key out of bounds");
    }
    let internal_key = &data[koff..koff + klen];
    let rest = &data[koff + klen..];
    let (vlen, voff) = get_varint32(rest)?;
    let vlen = vlen as usize;
    if voff + vlen > rest.len() {
        return errcorruption!("pm entry value out of bounds");
    }
    Ok(PmEntry {
        internal_key,
        value: &rest[voff..voff + vlen],
        encoded_len: koff + klen + voff + vlen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u32, 1, 127, 128, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            put_varint32(&mut buf, v);
            assert_eq!(buf.len(), varint32_length(v));
            let (decoded, used) = get_varint32(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(get_varint32(&[0x80]).is_err());
        assert!(get_varint32(&[]).is_err());
    }

    #[test]
    fn test_internal_key_roundtrip() {
        let mut buf = Vec::new();
        append_internal_key(&mut buf, b"alpha", 42, ValueType::Value);
        let parsed = parse_internal_key(&buf).unwrap();
        assert_eq!(parsed.user_key, b"alpha");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.vtype, ValueType::Value);
    }

    #[test]
    fn test_unknown_value_type_is_corruption() {
        let mut buf = b"k".to_vec();
        buf.extend_from_slice(&((7u64 << 8) | 9).to_le_bytes());
        assert!(parse_internal_key(&buf).is_err());
    }

    #[test]
    fn test_ordering_newest_first() {
        let mut a = Vec::new();
        append_internal_key(&mut a, b"k", 5, ValueType::Value);
        let mut b = Vec::new();
        append_internal_key(&mut b, b"k", 9, ValueType::Value);
        // Higher sequence sorts first for the same user key.
        assert_eq!(compare_internal_keys(&b, &a), Ordering::Less);
        // Different user keys order bytewise regardless of sequence.
        let mut c = Vec::new();
        append_internal_key(&mut c, b"l", 1, ValueType::Value);
        assert_eq!(compare_internal_keys(&a, &c), Ordering::Less);
    }

    #[test]
    fn test_seek_key_finds_older_versions() {
        let mut v7 = Vec::new();
        append_internal_key(&mut v7, b"k", 7, ValueType::Value);
        let seek = seek_key(b"k", 8);
        // Seeking at sequence 8 must position before the version at 7.
        assert_eq!(compare_internal_keys(&seek, &v7), Ordering::Less);
        let seek = seek_key(b"k", 6);
        assert_eq!(compare_internal_keys(&seek, &v7), Ordering::Greater);
    }

    #[test]
    fn test_pm_entry_roundtrip() {
        let buf = encode_pm_entry(b"key", 3, ValueType::Value, b"value");
        let entry = decode_pm_entry(&buf).unwrap();
        assert_eq!(entry.encoded_len, buf.len());
        let parsed = parse_internal_key(entry.internal_key).unwrap();
        assert_eq!(parsed.user_key, b"key");
        assert_eq!(parsed.sequence, 3);
        assert_eq!(entry.value, b"value");
    }

    #[test]
    fn test_pm_entry_truncated() {
        let buf = encode_pm_entry(b"key", 3, ValueType::Value, b"value");
        assert!(decode_pm_entry(&buf[..buf.len() - 1]).is_err());
    }
}
