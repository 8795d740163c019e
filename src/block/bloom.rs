//! Bloom filter over the document keys of a rowset.
//!
//! Point reads check the filter before touching a rowset's runs. Keys are the
//! encoded `DocKey` prefix of stored keys, so one probe covers every version
//! and every subkey of a document.
//!
//! Double hashing: `h(i) = h1 + i * h2`, where `h1` and `h2` are FNV-1a with two
//! different seeds.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound on a decoded filter.
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` keys at `false_positive_rate`.
    /// Out of range inputs are clamped.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        // m = -n * ln(p) / ln(2)^2, k = (m / n) * ln(2)
        let m = (-n * p.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            num_bits: m,
            num_hashes: k.clamp(1, 30),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// False means `key` was definitely never inserted.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 1
        })
    }

    /// `[num_bits: u64][num_hashes: u32][bits_len: u32][bits][crc32]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.bits.len());
        let _ = buf.write_u64::<BigEndian>(self.num_bits);
        let _ = buf.write_u32::<BigEndian>(self.num_hashes);
        let _ = buf.write_u32::<BigEndian>(self.bits.len() as u32);
        buf.extend_from_slice(&self.bits);
        let checksum = CRC32.checksum(&buf);
        let _ = buf.write_u32::<BigEndian>(checksum);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(Error::Corruption("bloom filter block is too short".into()));
        }
        let (body, mut trailer) = data.split_at(data.len() - 4);
        if trailer.read_u32::<BigEndian>()? != CRC32.checksum(body) {
            return Err(Error::Corruption("bloom filter checksum mismatch".into()));
        }

        let mut cursor = body;
        let num_bits = cursor.read_u64::<BigEndian>()?;
        let num_hashes = cursor.read_u32::<BigEndian>()?;
        let bits_len = cursor.read_u32::<BigEndian>()? as usize;
        if bits_len > MAX_BLOOM_BYTES || bits_len != cursor.len() || num_bits == 0 {
            return Err(Error::Corruption(format!(
                "bloom filter of {} bytes does not match its header",
                cursor.len()
            )));
        }
        if num_bits > bits_len as u64 * 8 {
            return Err(Error::Corruption("bloom filter bit count out of range".into()));
        }

        Ok(Self {
            bits: cursor.to_vec(),
            num_bits,
            num_hashes,
        })
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf29ce484222325),
        fnv1a_64(key, 0x517cc1b727220a95),
    )
}

fn fnv1a_64(data: &[u8], seed: u64) -> u64 {
    data.iter().fold(seed, |hash, &byte| {
        (hash ^ byte as u64).wrapping_mul(0x100000001b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000u32 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0..1000u32 {
            assert!(filter.may_contain(&i.to_be_bytes()));
        }

        let false_positives = (1000..11000u32)
            .filter(|i| filter.may_contain(&i.to_be_bytes()))
            .count();
        assert!(false_positives < 500, "{} false positives", false_positives);
    }

    #[test]
    fn test_encoded_filter_answers_the_same() {
        let mut filter = BloomFilter::new(10, 0.01);
        filter.insert(b"row1");
        let decoded = BloomFilter::decode(&filter.encode()).unwrap();
        assert!(decoded.may_contain(b"row1"));
        assert_eq!(decoded.num_hashes, filter.num_hashes);

        let mut damaged = filter.encode();
        damaged[0] ^= 1;
        assert!(BloomFilter::decode(&damaged).unwrap_err().is_corruption());
    }
}
