//! Generic payload compressor: a self-describing Huffman encoding whose
//! frequency table travels with the data. Worthwhile for inputs over
//! roughly 2 KiB; below that the 256-entry table dominates and the output
//! grows instead.

use crate::bitstream::BitStream;
use crate::error::{BinaryError, Result};
use crate::huffman::HuffmanTree;

/// Refuse to allocate more than this when decompressing, whatever the
/// header claims.
const MAX_DECOMPRESSED_BYTES: usize = 256 * 1024 * 1024;

/// Compresses `data` into `out`: compressed length, 256 compressed
/// frequency entries, a byte-aligned bit-count slot (backpatched after
/// encoding), then the Huffman bits.
pub fn compress(data: &[u8], out: &mut BitStream) -> Result<()> {
    let mut freq = [0u32; 256];
    for &b in data {
        freq[b as usize] += 1;
    }
    let tree = HuffmanTree::from_frequency_table(&freq);

    out.write_compressed_u32(data.len() as u32)?;
    for f in freq {
        out.write_compressed_u32(f)?;
    }
    out.align_write_to_byte();

    let patch_offset = out.write_offset();
    out.write_u32(0)?;
    let before = out.bits_used();
    tree.encode_array(data, out)?;
    let after = out.bits_used();

    let end = out.write_offset();
    out.set_write_offset(patch_offset);
    out.write_u32((after - before) as u32)?;
    out.set_write_offset(end);
    Ok(())
}

/// Inverse of [`compress`]. Malformed input yields an error, never a
/// panic or an oversized allocation.
pub fn decompress(input: &mut BitStream) -> Result<Vec<u8>> {
    let len = input.read_compressed_u32()? as usize;
    if len > MAX_DECOMPRESSED_BYTES {
        return Err(BinaryError::InvalidData(format!(
            "declared decompressed size {len} exceeds cap"
        )));
    }
    let mut freq = [0u32; 256];
    for f in freq.iter_mut() {
        *f = input.read_compressed_u32()?;
    }
    input.align_read_to_byte();
    let encoded_bits = input.read_u32()? as usize;

    let tree = HuffmanTree::from_frequency_table(&freq);
    let out = tree.decode_array(input, encoded_bits, len)?;
    if out.len() != len {
        return Err(BinaryError::InvalidData(format!(
            "decompressed {} bytes, header declared {len}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_large_input() {
        // Repetitive text well past the 2 KiB usefulness threshold.
        let mut data = Vec::new();
        while data.len() < 8 * 1024 {
            data.extend_from_slice(b"reliable ordered sequenced unreliable ");
        }
        let mut stream = BitStream::new();
        compress(&data, &mut stream).unwrap();
        assert!(stream.bytes_used() < data.len());

        stream.set_read_offset(0);
        assert_eq!(decompress(&mut stream).unwrap(), data);
    }

    #[test]
    fn round_trip_binary_noise() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut stream = BitStream::new();
        compress(&data, &mut stream).unwrap();
        stream.set_read_offset(0);
        assert_eq!(decompress(&mut stream).unwrap(), data);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let data = vec![7u8; 4096];
        let mut stream = BitStream::new();
        compress(&data, &mut stream).unwrap();
        let bytes = stream.into_bytes();
        let truncated = bytes.slice(..bytes.len() / 2);
        let mut stream = BitStream::from_bytes(truncated);
        assert!(decompress(&mut stream).is_err());
    }

    #[test]
    fn absurd_length_is_rejected() {
        let mut stream = BitStream::new();
        stream.write_compressed_u32(u32::MAX).unwrap();
        stream.set_read_offset(0);
        assert!(matches!(
            decompress(&mut stream),
            Err(BinaryError::InvalidData(_))
        ));
    }
}
