//! Per-table bloom filter over user keys.
//!
//! Point lookups consult the filter before touching the index, so a table
//! that definitely lacks the key costs no block read.
//!
//! Sizing follows `bits_per_key`: with 10 bits per key and
//! `k = bits_per_key * ln 2` probes the false positive rate is about 1%.
//! Probes use double hashing, `h_i = h1 + i * h2 (mod m)`, where `h1` and
//! `h2` are the halves of one xxh3-128 hash.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::Result;
use crate::Error;

pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

/// Hash of a user key, split later into the two probe seeds.
pub fn hash_key(key: &[u8]) -> u128 {
    xxh3_128(key)
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_items` keys.
    pub fn new(expected_items: usize, bits_per_key: usize) -> Self {
        let bits_per_key = bits_per_key.max(1);
        let num_bits = (expected_items.max(1) * bits_per_key).clamp(64, u32::MAX as usize) as u32;
        let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        let num_u64s = (num_bits as usize).div_ceil(64);
        Self {
            bits: vec![0u64; num_u64s],
            num_hashes,
            num_bits,
        }
    }

    /// Builds a filter from precomputed key hashes.
    pub fn from_hashes(hashes: &[u128], bits_per_key: usize) -> Self {
        let mut filter = Self::new(hashes.len(), bits_per_key);
        for hash in hashes {
            filter.insert_hash(*hash);
        }
        filter
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(hash_key(key));
    }

    fn insert_hash(&mut self, hash: u128) {
        let (h1, h2) = split(hash);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.set_bit(pos);
        }
    }

    /// false: definitely absent. true: probably present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split(hash_key(key));
        (0..self.num_hashes).all(|i| self.check_bit(self.position(h1, h2, i)))
    }

    /// `num_hashes: u32 | num_bits: u32 | words: u64*`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.bits.len() * 8);
        buf.write_u32::<BigEndian>(self.num_hashes).unwrap();
        buf.write_u32::<BigEndian>(self.num_bits).unwrap();
        for word in &self.bits {
            buf.write_u64::<BigEndian>(*word).unwrap();
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let num_hashes = data
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("bloom num_hashes", e))?;
        let num_bits = data
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("bloom num_bits", e))?;

        let num_u64s = (num_bits as usize).div_ceil(64);
        if num_bits == 0 || num_hashes == 0 || data.len() != num_u64s * 8 {
            return Err(Error::Corruption(format!(
                "bloom filter of {num_bits} bits has {} payload bytes",
                data.len()
            )));
        }

        let mut bits = Vec::with_capacity(num_u64s);
        for _ in 0..num_u64s {
            bits.push(
                data.read_u64::<BigEndian>()
                    .map_err(|e| Error::Decode("bloom bits", e))?,
            );
        }

        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u32 {
        let pos = h1.wrapping_add((i as u64).wrapping_mul(h2)) % (self.num_bits as u64);
        pos as u32
    }

    fn set_bit(&mut self, pos: u32) {
        self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
    }

    fn check_bit(&self, pos: u32) -> bool {
        (self.bits[(pos / 64) as usize] >> (pos % 64)) & 1 == 1
    }
}

fn split(hash: u128) -> (u64, u64) {
    (hash as u64, (hash >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basics() {
        let mut bf = BloomFilter::new(100, 10);
        bf.insert(b"hello");
        assert!(bf.may_contain(b"hello"));
        assert!(!bf.may_contain(b"world"));
        assert_eq!(bf.num_hashes(), 7);
    }

    #[test]
    fn test_no_false_negatives_and_low_fpr() {
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{i}").into_bytes()).collect();
        let hashes: Vec<u128> = keys.iter().map(|k| hash_key(k)).collect();
        let bf = BloomFilter::from_hashes(&hashes, 10);

        assert!(keys.iter().all(|k| bf.may_contain(k)));

        let false_positives = (0..1000)
            .filter(|i| bf.may_contain(format!("absent{i}").as_bytes()))
            .count();
        assert!(false_positives < 50, "too many false positives: {false_positives}");
    }

    #[test]
    fn test_encode_decode() {
        let mut bf = BloomFilter::new(10, 10);
        bf.insert(b"key1");
        bf.insert(b"key2");

        let decoded = BloomFilter::decode(&bf.encode()).unwrap();
        assert_eq!(decoded.num_bits(), bf.num_bits());
        assert!(decoded.may_contain(b"key1"));
        assert!(decoded.may_contain(b"key2"));

        assert!(BloomFilter::decode(&bf.encode()[..10]).is_err());
    }
}
