//! Internal keys.
//!
//! Every version of a user key is stored under an internal key made of the
//! user key and the sequence number of the write that produced it. Internal
//! keys sort by user key ascending and then by sequence descending, so the
//! newest version of a key is always the first one met by a forward scan.
//!
//! On disk an internal key is `user_key ++ BE_u64(seq << 8 | kind)`.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Largest sequence number representable in the 56 bits of the key trailer.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Length of the encoded `seq << 8 | kind` trailer.
pub const TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueKind {
    Delete = 0,
    Put = 1,
}

impl ValueKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ValueKind::Delete),
            1 => Ok(ValueKind::Put),
            other => Err(Error::Corruption(format!("unknown value kind {other}"))),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub seq: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            user_key: user_key.into(),
            seq,
        }
    }

    /// The smallest internal key for `user_key` visible at `seq`.
    pub fn seek(user_key: &[u8], seq: u64) -> Self {
        Self::new(user_key.to_vec(), seq)
    }

    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_SIZE
    }

    pub fn encode_into(&self, kind: ValueKind, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; TRAILER_SIZE];
        BigEndian::write_u64(&mut trailer, (self.seq << 8) | kind as u64);
        buf.extend_from_slice(&trailer);
    }

    pub fn encode(&self, kind: ValueKind) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(kind, &mut buf);
        buf
    }

    pub fn decode(encoded: &[u8]) -> Result<(Self, ValueKind)> {
        let (user_key, seq, kind) = split(encoded)?;
        Ok((Self::new(user_key.to_vec(), seq), kind))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            String::from_utf8_lossy(&self.user_key),
            self.seq
        )
    }
}

/// Splits an encoded internal key into its user key, sequence and kind.
pub fn split(encoded: &[u8]) -> Result<(&[u8], u64, ValueKind)> {
    if encoded.len() < TRAILER_SIZE {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            encoded.len()
        )));
    }
    let (user_key, trailer) = encoded.split_at(encoded.len() - TRAILER_SIZE);
    let packed = BigEndian::read_u64(trailer);
    let kind = ValueKind::from_u8((packed & 0xff) as u8)?;
    Ok((user_key, packed >> 8, kind))
}

/// User key portion of an encoded internal key.
pub fn user_key(encoded: &[u8]) -> &[u8] {
    &encoded[..encoded.len().saturating_sub(TRAILER_SIZE)]
}

/// Orders encoded internal keys the same way `InternalKey` orders decoded ones.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let (ua, ta) = a.split_at(a.len().saturating_sub(TRAILER_SIZE));
    let (ub, tb) = b.split_at(b.len().saturating_sub(TRAILER_SIZE));
    ua.cmp(ub).then_with(|| {
        let ta = if ta.len() == TRAILER_SIZE { BigEndian::read_u64(ta) } else { 0 };
        let tb = if tb.len() == TRAILER_SIZE { BigEndian::read_u64(tb) } else { 0 };
        tb.cmp(&ta)
    })
}
