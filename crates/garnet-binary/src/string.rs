//! Shared-tree string codec. Unlike [`crate::compress`], the frequency
//! table is agreed out of band (per "language" slot), so short strings
//! pay only their code bits plus a compressed length prefix.
//!
//! Carried as an explicit context object by whoever owns the connection
//! state; there is no global instance.

use crate::bitstream::BitStream;
use crate::error::{BinaryError, Result};
use crate::huffman::HuffmanTree;
use std::collections::HashMap;

/// English character frequencies, used for the default slot. Entries past
/// the prefix are zero and get promoted to weight 1 by the tree builder.
const ENGLISH_PREFIX: [u32; 127] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 722, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 11084, 58, 63, 1, 0, 31, 0, 317, 64, 64, 44, 0, 695, 62, 980, 266, 69, 67, 56, 7, 73,
    3, 14, 2, 69, 1, 167, 9, 1, 2, 25, 94, 0, 195, 139, 34, 96, 48, 103, 56, 125, 653, 21, 5,
    23, 64, 85, 44, 34, 7, 92, 76, 147, 12, 14, 57, 15, 39, 15, 1, 1, 1, 2, 3, 0, 3611, 845,
    1077, 1884, 5870, 841, 1057, 2501, 3212, 164, 531, 2019, 1330, 3056, 4037, 848, 47, 2586,
    2919, 4771, 1707, 535, 1106, 152, 1243, 100, 0, 2, 0, 10,
];

/// The default language slot, pre-built from English frequencies.
pub const DEFAULT_LANGUAGE: u8 = 0;

fn english_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    table[..ENGLISH_PREFIX.len()].copy_from_slice(&ENGLISH_PREFIX);
    table
}

/// One Huffman tree per language slot.
pub struct StringCodec {
    trees: HashMap<u8, HuffmanTree>,
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StringCodec {
    pub fn new() -> Self {
        let mut trees = HashMap::new();
        trees.insert(
            DEFAULT_LANGUAGE,
            HuffmanTree::from_frequency_table(&english_table()),
        );
        Self { trees }
    }

    /// Rebuilds a language slot from a representative corpus. Both ends
    /// of a connection must use the same corpus for the slot.
    pub fn generate_from_corpus(&mut self, language: u8, corpus: &[u8]) {
        let mut freq = [0u32; 256];
        for &b in corpus {
            freq[b as usize] += 1;
        }
        self.trees
            .insert(language, HuffmanTree::from_frequency_table(&freq));
    }

    /// Writes `s` as a compressed bit-length prefix followed by the code
    /// bits.
    pub fn write_str(&self, s: &str, out: &mut BitStream, language: u8) -> Result<()> {
        let tree = self.tree(language)?;
        let mut encoded = BitStream::new();
        let bit_len: usize = s.bytes().map(|b| tree.code_len(b)).sum();
        tree.encode_array(s.as_bytes(), &mut encoded)?;
        out.write_compressed_u32(bit_len as u32)?;
        out.write_bits(encoded.data(), bit_len, false)
    }

    /// Inverse of [`Self::write_str`], capped at `max_len` bytes.
    pub fn read_str(&self, input: &mut BitStream, max_len: usize, language: u8) -> Result<String> {
        let tree = self.tree(language)?;
        let bit_len = input.read_compressed_u32()? as usize;
        let bytes = tree.decode_array(input, bit_len, max_len)?;
        Ok(String::from_utf8(bytes)?)
    }

    fn tree(&self, language: u8) -> Result<&HuffmanTree> {
        self.trees.get(&language).ok_or_else(|| {
            BinaryError::InvalidData(format!("no string tree for language {language}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_round_trip() {
        let codec = StringCodec::new();
        let mut stream = BitStream::new();
        codec
            .write_str("hello reliable world", &mut stream, DEFAULT_LANGUAGE)
            .unwrap();
        let s = codec
            .read_str(&mut stream, 64, DEFAULT_LANGUAGE)
            .unwrap();
        assert_eq!(s, "hello reliable world");
    }

    #[test]
    fn shorter_than_raw_for_english_text() {
        let codec = StringCodec::new();
        let text = "the sender retransmits until the receiver acknowledges";
        let mut stream = BitStream::new();
        codec.write_str(text, &mut stream, DEFAULT_LANGUAGE).unwrap();
        assert!(stream.bytes_used() < text.len());
    }

    #[test]
    fn custom_corpus_slot() {
        let mut codec = StringCodec::new();
        codec.generate_from_corpus(3, b"abcabcabcabc");
        let mut stream = BitStream::new();
        codec.write_str("abc", &mut stream, 3).unwrap();
        assert_eq!(codec.read_str(&mut stream, 8, 3).unwrap(), "abc");
    }

    #[test]
    fn unknown_language_fails() {
        let codec = StringCodec::new();
        let mut stream = BitStream::new();
        assert!(codec.write_str("x", &mut stream, 9).is_err());
    }

    #[test]
    fn length_cap_truncates() {
        let codec = StringCodec::new();
        let mut stream = BitStream::new();
        codec
            .write_str("abcdefgh", &mut stream, DEFAULT_LANGUAGE)
            .unwrap();
        let s = codec.read_str(&mut stream, 4, DEFAULT_LANGUAGE).unwrap();
        assert_eq!(s, "abcd");
    }
}
