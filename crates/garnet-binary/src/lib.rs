//! # garnet-binary
//!
//! Bit-level serialization for the garnet networking stack: a growable
//! bit stream with compressed-integer and quantized-float encodings, a
//! frequency-table Huffman codec, a self-describing payload compressor,
//! and a shared-tree string codec.

pub mod bitstream;
pub mod compress;
pub mod error;
pub mod huffman;
pub mod string;

pub use bitstream::BitStream;
pub use error::{BinaryError, Result};
pub use huffman::HuffmanTree;
pub use string::{StringCodec, DEFAULT_LANGUAGE};
