//! Frequency-table Huffman codec.
//!
//! Builds a prefix tree from a 256-entry histogram and encodes octet runs
//! into a [`BitStream`]. Nodes live in an arena indexed by position;
//! per-symbol codes are generated by a stack-based walk from the root, so
//! no parent links are needed.

use crate::bitstream::BitStream;
use crate::error::{BinaryError, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Set for leaves; internal nodes carry `None`.
    symbol: Option<u8>,
    left: Option<usize>,
    right: Option<usize>,
}

/// One symbol's bit pattern, left-aligned in `bits`.
#[derive(Debug, Clone, Default)]
struct Code {
    bits: Vec<u8>,
    bit_len: u16,
}

impl Code {
    fn from_path(path: &[bool]) -> Self {
        let mut bits = vec![0u8; path.len().div_ceil(8)];
        for (i, &one) in path.iter().enumerate() {
            if one {
                bits[i >> 3] |= 0x80 >> (i & 7);
            }
        }
        Self {
            bits,
            bit_len: path.len() as u16,
        }
    }
}

/// Canonical Huffman tree over the 256 byte values.
#[derive(Debug)]
pub struct HuffmanTree {
    nodes: Vec<Node>,
    root: usize,
    codes: Vec<Code>,
}

impl HuffmanTree {
    /// Builds the tree by repeatedly merging the two lowest-weight nodes.
    /// Zero frequencies are promoted to 1 so every symbol stays reachable.
    pub fn from_frequency_table(freq: &[u32; 256]) -> Self {
        let mut nodes: Vec<Node> = Vec::with_capacity(511);
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(256);

        for (symbol, &f) in freq.iter().enumerate() {
            nodes.push(Node {
                symbol: Some(symbol as u8),
                left: None,
                right: None,
            });
            heap.push(Reverse((f.max(1) as u64, nodes.len() - 1)));
        }

        while heap.len() > 1 {
            let Reverse((w_left, left)) = heap.pop().expect("heap len checked");
            let Reverse((w_right, right)) = heap.pop().expect("heap len checked");
            nodes.push(Node {
                symbol: None,
                left: Some(left),
                right: Some(right),
            });
            heap.push(Reverse((w_left + w_right, nodes.len() - 1)));
        }
        let root = heap.pop().expect("256 leaves always leave a root").0 .1;

        let mut codes = vec![Code::default(); 256];
        let mut stack: Vec<(usize, Vec<bool>)> = vec![(root, Vec::new())];
        while let Some((idx, path)) = stack.pop() {
            let node = nodes[idx];
            if let Some(symbol) = node.symbol {
                codes[symbol as usize] = Code::from_path(&path);
            } else {
                let mut left_path = path.clone();
                left_path.push(false);
                let mut right_path = path;
                right_path.push(true);
                stack.push((node.left.expect("internal node"), left_path));
                stack.push((node.right.expect("internal node"), right_path));
            }
        }

        Self { nodes, root, codes }
    }

    /// Encodes `input` into `out`, then pads the final partial byte with
    /// the leading bits of a symbol whose code is longer than the pad, so
    /// a decoder that overruns the declared bit count cannot resolve the
    /// padding to a complete symbol.
    pub fn encode_array(&self, input: &[u8], out: &mut BitStream) -> Result<()> {
        for &byte in input {
            let code = &self.codes[byte as usize];
            out.write_bits(&code.bits, code.bit_len as usize, false)?;
        }
        let partial = out.bits_used() % 8;
        if partial != 0 {
            let remaining = 8 - partial;
            // 256 leaves guarantee some code longer than 7 bits.
            if let Some(code) = self
                .codes
                .iter()
                .find(|c| c.bit_len as usize > remaining)
            {
                out.write_bits(&code.bits, remaining, false)?;
            }
        }
        Ok(())
    }

    /// Decodes exactly `size_in_bits` bits from `input`, emitting at most
    /// `max_out` symbols. Trailing pad bits that do not complete a symbol
    /// are consumed and discarded.
    pub fn decode_array(
        &self,
        input: &mut BitStream,
        size_in_bits: usize,
        max_out: usize,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(max_out.min(size_in_bits));
        let mut cursor = self.root;
        for _ in 0..size_in_bits {
            let bit = input.read_bit()?;
            let node = &self.nodes[cursor];
            cursor = if bit { node.right } else { node.left }.ok_or_else(|| {
                BinaryError::InvalidData("walked past a Huffman leaf".into())
            })?;
            if let Some(symbol) = self.nodes[cursor].symbol {
                if out.len() < max_out {
                    out.push(symbol);
                }
                cursor = self.root;
            }
        }
        Ok(out)
    }

    /// Bit length of one symbol's code. Used by tests and by callers
    /// sizing worst-case output.
    pub fn code_len(&self, symbol: u8) -> usize {
        self.codes[symbol as usize].bit_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_for(data: &[u8]) -> [u32; 256] {
        let mut freq = [0u32; 256];
        for &b in data {
            freq[b as usize] += 1;
        }
        freq
    }

    #[test]
    fn round_trip_matches_input() {
        let data = b"the quick brown fox jumps over the lazy dog, twice: \
                     the quick brown fox jumps over the lazy dog";
        let tree = HuffmanTree::from_frequency_table(&table_for(data));

        let mut stream = BitStream::new();
        let before = stream.bits_used();
        tree.encode_array(data, &mut stream).unwrap();
        let encoded_bits = stream.bits_used() - before;

        // Count the payload bits (pad excluded) the way a framing layer
        // would: sum of per-symbol code lengths.
        let payload_bits: usize = data.iter().map(|&b| tree.code_len(b)).sum();
        assert!(encoded_bits >= payload_bits);
        assert!(encoded_bits - payload_bits < 8);

        let decoded = tree
            .decode_array(&mut stream, payload_bits, data.len())
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn skewed_table_compresses() {
        // A heavily skewed distribution should code the hot symbol short.
        let mut freq = [1u32; 256];
        freq[b'e' as usize] = 10_000;
        let tree = HuffmanTree::from_frequency_table(&freq);
        assert!(tree.code_len(b'e') < 4);
        assert!(tree.code_len(0x00) > tree.code_len(b'e'));
    }

    #[test]
    fn zero_frequencies_stay_decodable() {
        // Symbols absent from the histogram still get codes.
        let freq = [0u32; 256];
        let tree = HuffmanTree::from_frequency_table(&freq);
        let data = [0u8, 255, 17, 42];
        let mut stream = BitStream::new();
        tree.encode_array(&data, &mut stream).unwrap();
        let bits: usize = data.iter().map(|&b| tree.code_len(b)).sum();
        let decoded = tree.decode_array(&mut stream, bits, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn pad_never_decodes_as_symbol() {
        let data = b"aaaabbbbccccdddd";
        let tree = HuffmanTree::from_frequency_table(&table_for(data));
        let mut stream = BitStream::new();
        tree.encode_array(data, &mut stream).unwrap();
        assert_eq!(stream.bits_used() % 8, 0);

        // Decoding the whole padded run must not yield an extra symbol.
        let decoded = tree
            .decode_array(&mut stream, stream.bits_used(), data.len() + 1)
            .unwrap();
        assert_eq!(decoded, data);
    }
}
