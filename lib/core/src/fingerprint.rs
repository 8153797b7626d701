//! Perceptual fingerprint codec.
//!
//! A fingerprint of `size` N is the N×N low-frequency corner of the 2D DCT of
//! a (4N)×(4N) grayscale downsample, thresholded at its median. Bits are kept
//! row-major and compared with Hamming distance.

use crate::{Error, Result};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Upscale factor between the fingerprint grid and the DCT input.
const OVERSAMPLE: u32 = 4;

/// Largest supported grid edge; 64×64 = 4096 bits.
pub const MAX_FINGERPRINT_SIZE: u32 = 64;

/// Fixed-length perceptual bit vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    size: u32,
    words: Vec<u64>,
}

impl Fingerprint {
    fn zeroed(size: u32) -> Self {
        let bits = (size * size) as usize;
        Self {
            size,
            words: vec![0; bits.div_ceil(64)],
        }
    }

    /// Builds a fingerprint from row-major bits; `bits.len()` must be `size * size`.
    pub fn from_bits(size: u32, bits: &[bool]) -> Result<Self> {
        check_size(size)?;
        if bits.len() != (size * size) as usize {
            return Err(Error::InvalidFingerprint(format!(
                "expected {} bits for size {}, got {}",
                size * size,
                size,
                bits.len()
            )));
        }
        let mut fp = Self::zeroed(size);
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                fp.set(i);
            }
        }
        Ok(fp)
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn bit_len(&self) -> usize {
        (self.size * self.size) as usize
    }

    #[inline]
    #[must_use]
    pub fn bit(&self, index: usize) -> bool {
        self.words[index / 64] >> (index % 64) & 1 == 1
    }

    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    /// Hamming distance. Only defined between fingerprints of equal size.
    pub fn distance(&self, other: &Fingerprint) -> Result<u32> {
        if self.size != other.size {
            return Err(Error::IncompatibleFingerprint {
                left: self.size,
                right: other.size,
            });
        }
        Ok(crate::simd::hamming_words(&self.words, &other.words))
    }

    /// Hex text encoding: the bit string read most-significant-first, left
    /// padded to a whole number of nibbles. A size-10 fingerprint is 25 digits.
    pub fn to_hex(&self) -> String {
        let n = self.bit_len();
        let width = n.div_ceil(4);
        let pad = width * 4 - n;
        let mut out = String::with_capacity(width);
        for nibble in 0..width {
            let mut value = 0u32;
            for b in 0..4 {
                let padded = nibble * 4 + b;
                if padded >= pad && self.bit(padded - pad) {
                    value |= 1 << (3 - b);
                }
            }
            out.push(char::from_digit(value, 16).unwrap_or('0'));
        }
        out
    }

    /// Parses the encoding produced by [`Fingerprint::to_hex`]. Case-insensitive.
    pub fn from_hex(hex: &str, size: u32) -> Result<Self> {
        check_size(size)?;
        let n = (size * size) as usize;
        let width = n.div_ceil(4);
        let hex = hex.trim();
        if hex.len() != width {
            return Err(Error::InvalidFingerprint(format!(
                "expected {} hex digits for size {}, got {}",
                width,
                size,
                hex.len()
            )));
        }
        let pad = width * 4 - n;
        let mut fp = Self::zeroed(size);
        for (nibble, ch) in hex.chars().enumerate() {
            let value = ch
                .to_digit(16)
                .ok_or_else(|| Error::InvalidFingerprint(format!("non-hex digit {:?}", ch)))?;
            for b in 0..4 {
                if value >> (3 - b) & 1 == 0 {
                    continue;
                }
                let padded = nibble * 4 + b;
                if padded < pad {
                    return Err(Error::InvalidFingerprint(format!(
                        "value exceeds {} bits",
                        n
                    )));
                }
                fp.set(padded - pad);
            }
        }
        Ok(fp)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn check_size(size: u32) -> Result<()> {
    if !(2..=MAX_FINGERPRINT_SIZE).contains(&size) {
        return Err(Error::InvalidFingerprint(format!(
            "size must be in 2..={}, got {}",
            MAX_FINGERPRINT_SIZE, size
        )));
    }
    Ok(())
}

/// Computes the fingerprint of decoded pixels. Deterministic for identical
/// pixels and `size`.
pub fn compute(pixels: &DynamicImage, size: u32) -> Result<Fingerprint> {
    check_size(size)?;
    if pixels.width() == 0 || pixels.height() == 0 {
        return Err(Error::InvalidFingerprint("empty image".to_string()));
    }

    let edge = size * OVERSAMPLE;
    let gray = imageops::resize(&pixels.to_luma8(), edge, edge, FilterType::Lanczos3);
    let n = edge as usize;
    let k = size as usize;
    let samples: Vec<f64> = gray.pixels().map(|p| f64::from(p.0[0])).collect();
    let basis = dct_basis(n, k);

    // Rows first: n rows -> k coefficients each.
    let mut rows = vec![0.0f64; n * k];
    for r in 0..n {
        let row = &samples[r * n..(r + 1) * n];
        for u in 0..k {
            let coeffs = &basis[u * n..(u + 1) * n];
            rows[r * k + u] = row.iter().zip(coeffs).map(|(x, c)| x * c).sum();
        }
    }

    // Then columns over the k retained coefficients.
    let mut low = vec![0.0f64; k * k];
    for v in 0..k {
        let coeffs = &basis[v * n..(v + 1) * n];
        for u in 0..k {
            let mut acc = 0.0;
            for (r, c) in coeffs.iter().enumerate() {
                acc += rows[r * k + u] * c;
            }
            low[v * k + u] = acc;
        }
    }

    let threshold = median(&low);
    let bits: Vec<bool> = low.iter().map(|&c| c > threshold).collect();
    Fingerprint::from_bits(size, &bits)
}

/// Unnormalised DCT-II basis, first `k` frequencies over `n` samples.
fn dct_basis(n: usize, k: usize) -> Vec<f64> {
    let mut basis = Vec::with_capacity(n * k);
    for u in 0..k {
        for x in 0..n {
            basis.push(2.0 * (PI * u as f64 * (2 * x + 1) as f64 / (2 * n) as f64).cos());
        }
    }
    basis
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Free-function form of [`Fingerprint::distance`].
pub fn distance(a: &Fingerprint, b: &Fingerprint) -> Result<u32> {
    a.distance(b)
}
