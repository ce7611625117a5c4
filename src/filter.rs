//! Bloom filters for the memtable and for minirun filter blocks.
//!
//! Double hashing over a single xxh3 128-bit hash: h_i(key) = h1 + i * h2
//! (mod m). Serialized form (little-endian):
//!
//! ```text
//! [num_hashes: u32][num_bits: u32][num_words: u32][bits: num_words x u64]
//! ```

use xxhash_rust::xxh3::xxh3_128;

use crate::error::Result;

pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` at the given false-positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let rate = false_positive_rate.clamp(1e-6, 0.5);

        let bits_per_key = -1.44 * rate.log2();
        let num_bits = (((expected_items as f64) * bits_per_key).ceil() as u32).max(64);
        let num_hashes = ((bits_per_key * 2.0f64.ln()).ceil() as u32).max(1);

        let num_words = (num_bits as usize).div_ceil(64);
        Self {
            bits: vec![0u64; num_words],
            num_hashes,
            num_bits,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            if (self.bits[(pos / 64) as usize] >> (pos % 64)) & 1 == 0 {
                return false;
            }
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return errcorruption!("bloom filter block shorter than its header");
        }
        let num_hashes = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let num_bits = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let num_words = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if num_words != (num_bits as usize).div_ceil(64) {
            return errcorruption!("bloom filter word count does not match bit count");
        }
        if data.len() != 12 + num_words * 8 {
            return errcorruption!("bloom filter block length mismatch");
        }
        let mut bits = Vec::with_capacity(num_words);
        for chunk in data[12..].chunks_exact(8) {
            bits.push(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u32 {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as u32
    }
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    (hash as u64, (hash >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.insert(b"alpha");
        filter.insert(b"beta");
        assert!(filter.may_contain(b"alpha"));
        assert!(filter.may_contain(b"beta"));
        assert!(!filter.may_contain(b"gamma"));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut filter = BloomFilter::new(64, 0.01);
        for i in 0..64u32 {
            filter.insert(&i.to_be_bytes());
        }
        let decoded = BloomFilter::decode(&filter.encode()).unwrap();
        for i in 0..64u32 {
            assert!(decoded.may_contain(&i.to_be_bytes()));
        }
    }

    #[test]
    fn test_decode_rejects_mangled_header() {
        let mut bytes = BloomFilter::new(16, 0.01).encode();
        bytes[8] ^= 0xff;
        assert!(BloomFilter::decode(&bytes).is_err());
        assert!(BloomFilter::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_false_positive_rate_is_sane() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000u32 {
            filter.insert(format!("key{i}").as_bytes());
        }
        let mut false_positives = 0;
        for i in 1000..11_000u32 {
            if filter.may_contain(format!("key{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // 1% target; allow generous slack to keep the test deterministic.
        assert!(false_positives < 500, "false positives: {false_positives}");
    }
}
