//! Template codec (C1): pack/unpack ordered binary arrays to/from a
//! self-describing blob, with an optional AES-256-GCM envelope at rest.
//!
//! Blob prefixes uniquely identify format (spec §3): `"EYED1"` (5B) is an
//! AES-GCM envelope; `PK\x03\x04` is a plain zip-style archive; `"HEv1"` is
//! handed to [`crate::he::blob`].

pub mod aes;
pub mod plain;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IrisRegError;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("blob prefix not recognized or archive truncated: {0}")]
    Decode(String),
    #[error("encryption key required but not configured")]
    MissingKey,
    #[error("AES-GCM authentication tag did not verify")]
    AuthTagFail,
    #[error("encryption key has the wrong length: expected 32 bytes, got {0}")]
    WrongKeyLength(usize),
}

impl From<CodecError> for IrisRegError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Decode(msg) => Self::Decode(msg),
            CodecError::MissingKey => Self::MissingKey,
            CodecError::AuthTagFail => Self::AuthTagFail,
            CodecError::WrongKeyLength(n) => {
                Self::Config(format!("encryption key must be 32 bytes, got {n}"))
            }
        }
    }
}

/// A single scale's worth of bits, shape `(height, width, depth)` — typically
/// `(16, 256, 2)`, 8192 bits. Stored one byte per bit (0 or 1) rather than
/// bit-packed: the arrays involved are small (1KB) and the unpacked form
/// keeps the matching/HE-encoding code free of bit-twiddling edge cases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGrid {
    pub height: u16,
    pub width: u16,
    pub depth: u16,
    bits: Vec<u8>,
}

impl CodeGrid {
    pub fn new(height: u16, width: u16, depth: u16, bits: Vec<u8>) -> Result<Self, CodecError> {
        let expected = height as usize * width as usize * depth as usize;
        if bits.len() != expected {
            return Err(CodecError::Decode(format!(
                "grid has {} bits, expected {} for shape ({},{},{})",
                bits.len(),
                expected,
                height,
                width,
                depth
            )));
        }
        if bits.iter().any(|&b| b > 1) {
            return Err(CodecError::Decode("grid bits must be 0 or 1".into()));
        }
        Ok(Self {
            height,
            width,
            depth,
            bits,
        })
    }

    pub fn zeros(height: u16, width: u16, depth: u16) -> Self {
        Self {
            height,
            width,
            depth,
            bits: vec![0u8; height as usize * width as usize * depth as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn as_bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn same_shape(&self, other: &Self) -> bool {
        self.height == other.height && self.width == other.width && self.depth == other.depth
    }

    pub fn popcount(&self) -> u32 {
        self.bits.iter().map(|&b| b as u32).sum()
    }

    /// Element-wise AND (binary multiply).
    pub fn and(&self, other: &Self) -> Self {
        debug_assert!(self.same_shape(other));
        let bits = self
            .bits
            .iter()
            .zip(&other.bits)
            .map(|(&a, &b)| a & b)
            .collect();
        Self { bits, ..*self }
    }

    /// Element-wise XOR.
    pub fn xor(&self, other: &Self) -> Self {
        debug_assert!(self.same_shape(other));
        let bits = self
            .bits
            .iter()
            .zip(&other.bits)
            .map(|(&a, &b)| a ^ b)
            .collect();
        Self { bits, ..*self }
    }

    /// Cyclically shifts along the angular axis (the `width` dimension),
    /// independently per row and per depth channel.
    pub fn rotated(&self, shift: i32) -> Self {
        let (h, w, d) = (self.height as i64, self.width as i64, self.depth as i64);
        let mut out = vec![0u8; self.bits.len()];
        let shift = ((shift as i64 % w) + w) % w;
        for row in 0..h {
            for col in 0..w {
                let src_col = ((col - shift) % w + w) % w;
                for ch in 0..d {
                    let dst_idx = ((row * w + col) * d + ch) as usize;
                    let src_idx = ((row * w + src_col) * d + ch) as usize;
                    out[dst_idx] = self.bits[src_idx];
                }
            }
        }
        Self {
            height: self.height,
            width: self.width,
            depth: self.depth,
            bits: out,
        }
    }
}

/// A plaintext enrolled or probe template: ordered per-scale iris and mask
/// codes plus quality/device metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrisTemplate {
    pub iris_codes: Vec<CodeGrid>,
    pub mask_codes: Vec<CodeGrid>,
}

impl IrisTemplate {
    pub fn n_scales(&self) -> usize {
        self.iris_codes.len()
    }

    /// `(width, height, n_scales)` of the first scale, as persisted in a
    /// template row. `(0, 0, 0)` for a template with no scales.
    pub fn dims(&self) -> (i32, i32, i32) {
        let first = self.iris_codes.first();
        (
            first.map(|g| g.width as i32).unwrap_or(0),
            first.map(|g| g.height as i32).unwrap_or(0),
            self.n_scales() as i32,
        )
    }

    /// Enforces the spec's "every template has |iris_codes| = |mask_codes| =
    /// n_scales, and per scale the mask has the same shape as the code".
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.iris_codes.len() != self.mask_codes.len() {
            return Err(CodecError::Decode(format!(
                "iris_codes has {} scales, mask_codes has {}",
                self.iris_codes.len(),
                self.mask_codes.len()
            )));
        }
        for (iris, mask) in self.iris_codes.iter().zip(&self.mask_codes) {
            if !iris.same_shape(mask) {
                return Err(CodecError::Decode("iris/mask shape mismatch within a scale".into()));
            }
        }
        Ok(())
    }
}

/// Packing mode for [`pack`]. `He` is not produced here — encrypted
/// templates are built and serialized by [`crate::he`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    Plain,
}

/// Packs an ordered sequence of arrays (e.g. `iris_codes` or `mask_codes`)
/// into a single self-describing blob. Envelopes the archive in AES-256-GCM
/// when an encryption key is present in the environment; otherwise emits a
/// plain archive.
pub fn pack(codes: &[CodeGrid], mode: PackMode) -> Result<Vec<u8>, CodecError> {
    match mode {
        PackMode::Plain => {
            let archive = plain::encode(codes)?;
            match aes::key_from_env()? {
                Some(key) => aes::encrypt(&key, &archive),
                None => Ok(archive),
            }
        }
    }
}

/// Dispatches on prefix: decrypts an EYED1 envelope first if present, then
/// decodes the (now-plaintext) archive. HE blobs are rejected here — callers
/// that may receive either should check [`crate::he::blob::is_he_blob`]
/// first and route accordingly.
pub fn unpack(blob: &[u8]) -> Result<Vec<CodeGrid>, CodecError> {
    let plain_blob = aes::decrypt_if_enveloped(blob)?;
    plain::decode(&plain_blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_grid(seed: u8) -> CodeGrid {
        let bits: Vec<u8> = (0..(4 * 6 * 2))
            .map(|i| ((i as u16 + seed as u16) % 2) as u8)
            .collect();
        CodeGrid::new(4, 6, 2, bits).unwrap()
    }

    #[test]
    fn rotation_is_cyclic_and_reversible() {
        let grid = sample_grid(3);
        let rotated = grid.rotated(2);
        let restored = rotated.rotated(-2);
        assert_eq!(grid, restored);
    }

    #[test]
    fn rotation_by_width_is_identity() {
        let grid = sample_grid(1);
        assert_eq!(grid, grid.rotated(grid.width as i32));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let bits = vec![0u8; 5];
        assert!(CodeGrid::new(2, 2, 2, bits).is_err());
    }

    #[test]
    fn rejects_non_binary_bits() {
        let bits = vec![0u8, 1, 2, 1];
        assert!(CodeGrid::new(1, 2, 2, bits).is_err());
    }
}
