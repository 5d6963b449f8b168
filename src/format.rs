//! Internal key encoding.
//!
//! An internal key is the user key followed by an 8-byte trailer packing a
//! 56-bit sequence number with a one-byte kind: `(seq << 8) | kind`, stored
//! little-endian. Internal keys order by user key ascending and trailer
//! descending, so the newest entry for a user key is encountered first.

use crate::byteutils::{decode_fixed64, put_fixed64};
use crate::error::Error;
use crate::Result;

pub type SequenceNumber = u64;

/// Sequence numbers use at most 56 bits so they can share a u64 with the kind.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

pub const TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
    /// Query sentinel: sorts before any stored entry with the same user key
    /// and a sequence at or below the query's. Never written to storage.
    Seek = 2,
}

impl ValueKind {
    pub fn from_u8(byte: u8) -> Result<ValueKind> {
        match byte {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            2 => Ok(ValueKind::Seek),
            _ => Err(Error::corruption(format!("unknown value kind: {}", byte))),
        }
    }
}

#[inline]
pub fn pack_trailer(seq: SequenceNumber, kind: ValueKind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | kind as u64
}

#[inline]
pub fn append_trailer(dst: &mut Vec<u8>, seq: SequenceNumber, kind: ValueKind) {
    put_fixed64(dst, pack_trailer(seq, kind));
}

pub fn pack_internal_key(user_key: &[u8], seq: SequenceNumber, kind: ValueKind) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    ikey.extend_from_slice(user_key);
    append_trailer(&mut ikey, seq, kind);
    ikey
}

#[inline]
pub fn user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= TRAILER_SIZE);
    &ikey[..ikey.len() - TRAILER_SIZE]
}

#[inline]
pub fn trailer(ikey: &[u8]) -> u64 {
    debug_assert!(ikey.len() >= TRAILER_SIZE);
    decode_fixed64(&ikey[ikey.len() - TRAILER_SIZE..])
}

#[inline]
pub fn sequence(ikey: &[u8]) -> SequenceNumber {
    trailer(ikey) >> 8
}

pub fn kind(ikey: &[u8]) -> Result<ValueKind> {
    ValueKind::from_u8((trailer(ikey) & 0xff) as u8)
}

/// Splits an internal key into its parts, validating length and kind.
pub fn parse_internal_key(ikey: &[u8]) -> Result<(&[u8], SequenceNumber, ValueKind)> {
    if ikey.len() < TRAILER_SIZE {
        return Err(Error::corruption("internal key too short"));
    }
    let kind = kind(ikey)?;
    Ok((user_key(ikey), sequence(ikey), kind))
}

/// The internal key used to position a point lookup: for user key `k` at
/// visibility `seq` it sorts immediately before every entry for `k` whose
/// sequence is at most `seq`.
pub struct LookupKey {
    ikey: Vec<u8>,
    user_len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> LookupKey {
        LookupKey {
            ikey: pack_internal_key(user_key, seq, ValueKind::Seek),
            user_len: user_key.len(),
        }
    }

    #[inline]
    pub fn internal_key(&self) -> &[u8] {
        &self.ikey
    }

    #[inline]
    pub fn user_key(&self) -> &[u8] {
        &self.ikey[..self.user_len]
    }

    #[inline]
    pub fn sequence(&self) -> SequenceNumber {
        sequence(&self.ikey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let ikey = pack_internal_key(b"user-key", 0x00ab_cdef, ValueKind::Value);
        let (ukey, seq, kind) = parse_internal_key(&ikey).unwrap();
        assert_eq!(ukey, b"user-key");
        assert_eq!(seq, 0x00ab_cdef);
        assert_eq!(kind, ValueKind::Value);
    }

    #[test]
    fn test_empty_user_key() {
        let ikey = pack_internal_key(b"", 7, ValueKind::Deletion);
        let (ukey, seq, kind) = parse_internal_key(&ikey).unwrap();
        assert!(ukey.is_empty());
        assert_eq!(seq, 7);
        assert_eq!(kind, ValueKind::Deletion);
    }

    #[test]
    fn test_bad_kind_rejected() {
        let mut ikey = pack_internal_key(b"k", 1, ValueKind::Value);
        let len = ikey.len();
        ikey[len - TRAILER_SIZE] = 9;
        assert!(parse_internal_key(&ikey).is_err());
    }

    #[test]
    fn test_lookup_key() {
        let lk = LookupKey::new(b"foo", 42);
        assert_eq!(lk.user_key(), b"foo");
        assert_eq!(lk.sequence(), 42);
        assert_eq!(user_key(lk.internal_key()), b"foo");
        assert_eq!(kind(lk.internal_key()).unwrap(), ValueKind::Seek);
    }
}
