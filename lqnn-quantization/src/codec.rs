/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::ceil_div;
use thiserror::Error;

/// The number of values packed into one plane word.
pub const WORD_BITS: usize = 32;

/// Errors detected while constructing an [`LqCodec`].
///
/// Construction is the only fallible operation; a constructed codec cannot
/// fail at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bits per value must be in [1, 31], got {0}")]
    InvalidBits(usize),

    #[error("cannot encode a zero-length vector")]
    EmptyVector,
}

/// One reconstructable value together with the bit pattern that produces it.
#[derive(Debug, Clone, Copy)]
struct Level {
    value: f32,
    encoding: u32,
}

/// Encoder/decoder for one vector length and one scale vector.
///
/// The codec owns a `K x ceil(N/32)` plane buffer that [`LqCodec::quantize`]
/// refills on each call, so a single instance can encode many vectors of the
/// same length (the fully-connected kernel reuses one per input row).
///
/// # Example
/// ```rust
/// use lqnn_quantization::LqCodec;
///
/// let mut codec = LqCodec::new(5, &[0.5, 1.0]).unwrap();
/// codec.quantize(&[-2.0, -0.4, 0.2, 0.9, 2.0]);
/// assert_eq!(codec.dequantize(), vec![-1.5, -0.5, 0.5, 0.5, 1.5]);
/// ```
#[derive(Debug, Clone)]
pub struct LqCodec {
    len: usize,
    words: usize,
    bits: usize,
    scales: Vec<f32>,
    planes: Vec<u32>,
    levels: Vec<Level>,
    thresholds: Vec<f32>,
}

impl LqCodec {
    /// Construct a codec for vectors of length `len` encoded with
    /// `scales.len()` bits per value.
    ///
    /// The level table is `2^K` entries; `K` is bounded below 32 so both the
    /// table and the plane words stay within 32-bit arithmetic.
    pub fn new(len: usize, scales: &[f32]) -> Result<Self, CodecError> {
        let bits = scales.len();
        if bits < 1 || bits >= WORD_BITS {
            return Err(CodecError::InvalidBits(bits));
        }
        if len == 0 {
            return Err(CodecError::EmptyVector);
        }

        let words = ceil_div(len, WORD_BITS);
        let level_count = 1usize << bits;

        // Each encoding reconstructs to the signed sum of the scales.
        let mut levels: Vec<Level> = (0..level_count as u32)
            .map(|encoding| {
                let value = scales
                    .iter()
                    .enumerate()
                    .map(|(b, s)| if (encoding >> b) & 1 == 1 { *s } else { -*s })
                    .sum();
                Level { value, encoding }
            })
            .collect();

        // The all-minus and all-plus encodings are extremal for sorted
        // non-negative scales and keep their places; a full stable sort
        // produces the same table either way.
        levels.sort_by(|lhs, rhs| lhs.value.total_cmp(&rhs.value));

        // Threshold i is the midpoint between levels i-1 and i; values encode
        // to the largest level whose threshold lies strictly below them.
        let mut thresholds = Vec::with_capacity(level_count);
        thresholds.push(f32::NEG_INFINITY);
        for i in 1..level_count {
            thresholds.push((levels[i - 1].value + levels[i].value) / 2.0);
        }

        Ok(Self {
            len,
            words,
            bits,
            scales: scales.to_vec(),
            planes: vec![0; bits * words],
            levels,
            thresholds,
        })
    }

    /// The vector length the codec was sized for.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `ceil(len / 32)`: words per plane.
    pub fn words(&self) -> usize {
        self.words
    }

    /// Bits per encoded value.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// The plane buffer, `bits()` planes of `words()` words each.
    pub fn planes(&self) -> &[u32] {
        &self.planes
    }

    // Returns the encoding whose level satisfies `t[l] < value <= t[l + 1]`.
    fn search_encoding(&self, value: f32) -> u32 {
        let mut left = 0usize;
        let mut right = self.levels.len() - 1;
        while left < right {
            let middle = (left + right + 1) >> 1;
            if self.thresholds[middle] < value {
                left = middle;
            } else {
                right = middle - 1;
            }
        }
        self.levels[left].encoding
    }

    /// Encode `data` into the plane buffer.
    ///
    /// Tail bits past `len` are left zero; consumers of the packed planes
    /// rely on that (see the popcount correction in the LQ-FC kernel).
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != self.len()`.
    pub fn quantize(&mut self, data: &[f32]) {
        assert_eq!(data.len(), self.len);
        self.planes.fill(0);

        for (i, value) in data.iter().enumerate() {
            let encoding = self.search_encoding(*value);

            let word = i >> 5;
            let offset = (i & 31) as u32;
            for b in 0..self.bits {
                self.planes[b * self.words + word] |= ((encoding >> b) & 1) << offset;
            }
        }
    }

    /// Reconstruct the encoded vector from the plane buffer.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut data = vec![0.0f32; self.len];
        self.dequantize_into(&mut data);
        data
    }

    /// Reconstruct the encoded vector into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() != self.len()`.
    pub fn dequantize_into(&self, out: &mut [f32]) {
        assert_eq!(out.len(), self.len);
        for (i, value) in out.iter_mut().enumerate() {
            let word = i >> 5;
            let offset = (i & 31) as u32;
            let mut acc = 0.0f32;
            for b in 0..self.bits {
                let bit = (self.planes[b * self.words + word] >> offset) & 1;
                acc += if bit == 1 {
                    self.scales[b]
                } else {
                    -self.scales[b]
                };
            }
            *value = acc;
        }
    }

    /// Unpack the plane buffer into `out` as `±1` bytes, value-major:
    /// `out[i * bits + b]` is the sign of plane `b` for value `i`.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() != self.bits() * self.len()`.
    pub fn unpack_signs(&self, out: &mut [i8]) {
        assert_eq!(out.len(), self.bits * self.len);
        for i in 0..self.len {
            let word = i >> 5;
            let offset = (i & 31) as u32;
            for b in 0..self.bits {
                let bit = (self.planes[b * self.words + word] >> offset) & 1;
                out[i * self.bits + b] = if bit == 1 { 1 } else { -1 };
            }
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn construction_bounds() {
        assert_eq!(LqCodec::new(8, &[]).unwrap_err(), CodecError::InvalidBits(0));
        assert_eq!(
            LqCodec::new(8, &vec![1.0; 32]).unwrap_err(),
            CodecError::InvalidBits(32)
        );
        assert_eq!(LqCodec::new(0, &[1.0]).unwrap_err(), CodecError::EmptyVector);
        assert!(LqCodec::new(8, &vec![1.0; 31]).is_ok());
    }

    #[test]
    fn two_bit_levels_and_thresholds() {
        // Levels for scales [0.5, 1.0] are [-1.5, -0.5, 0.5, 1.5] with
        // thresholds [-inf, -1.0, 0.0, 1.0].
        let mut codec = LqCodec::new(5, &[0.5, 1.0]).unwrap();
        codec.quantize(&[-2.0, -0.4, 0.2, 0.9, 2.0]);
        assert_eq!(codec.dequantize(), vec![-1.5, -0.5, 0.5, 0.5, 1.5]);
    }

    #[test]
    fn one_bit_is_sign_quantization() {
        let mut codec = LqCodec::new(4, &[1.0]).unwrap();
        codec.quantize(&[-3.0, -0.001, 0.001, 3.0]);
        assert_eq!(codec.dequantize(), vec![-1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn tail_bits_stay_zero() {
        // 33 values forces a second plane word with 31 tail bits.
        let mut codec = LqCodec::new(33, &[1.0]).unwrap();
        codec.quantize(&vec![5.0; 33]);
        let planes = codec.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0], u32::MAX);
        assert_eq!(planes[1], 1);
    }

    fn gaussian_ish(rng: &mut StdRng, len: usize) -> Vec<f32> {
        // Sum of uniforms; enough spread to cover the whole lattice.
        (0..len)
            .map(|_| {
                let sum: f32 = (0..6).map(|_| rng.random::<f32>()).sum();
                sum - 3.0
            })
            .collect()
    }

    fn sorted_scales(rng: &mut StdRng, bits: usize) -> Vec<f32> {
        let mut scales: Vec<f32> = (0..bits).map(|_| rng.random::<f32>()).collect();
        scales.sort_by(f32::total_cmp);
        scales
    }

    #[test]
    fn round_trip_hits_nearest_level() {
        let mut rng = StdRng::seed_from_u64(0x6d3dcbc02e6b1f40);
        for len in [1usize, 32, 33, 64, 1000] {
            for bits in 1..=4usize {
                let scales = sorted_scales(&mut rng, bits);
                let data = gaussian_ish(&mut rng, len);

                let mut codec = LqCodec::new(len, &scales).unwrap();
                codec.quantize(&data);
                let decoded = codec.dequantize();

                // Every reconstructable level, by brute force.
                let levels: Vec<f32> = (0..1u32 << bits)
                    .map(|e| {
                        scales
                            .iter()
                            .enumerate()
                            .map(|(b, s)| if (e >> b) & 1 == 1 { *s } else { -*s })
                            .sum()
                    })
                    .collect();

                for (i, (&x, &x_hat)) in std::iter::zip(data.iter(), decoded.iter()).enumerate() {
                    assert!(
                        levels.iter().any(|l| (l - x_hat).abs() < 1e-6),
                        "decoded value {} is not a lattice point (len = {}, bits = {})",
                        x_hat,
                        len,
                        bits
                    );

                    let best = levels
                        .iter()
                        .map(|l| (l - x).abs())
                        .fold(f32::INFINITY, f32::min);
                    assert!(
                        (x_hat - x).abs() <= best + 1e-5,
                        "value {} at index {} decoded to {}, nearest level is {} away \
                         (len = {}, bits = {})",
                        x,
                        i,
                        x_hat,
                        best,
                        len,
                        bits
                    );
                }
            }
        }
    }

    #[test]
    fn quantization_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(0x2f4a1c8be97d3310);
        for len in [1usize, 32, 33, 64, 1000] {
            for bits in 1..=4usize {
                let scales = sorted_scales(&mut rng, bits);
                let data = gaussian_ish(&mut rng, len);

                let mut codec = LqCodec::new(len, &scales).unwrap();
                codec.quantize(&data);
                let first = codec.planes().to_vec();

                let reconstruction = codec.dequantize();
                codec.quantize(&reconstruction);
                assert_eq!(
                    codec.planes(),
                    first.as_slice(),
                    "re-encoding the reconstruction changed the planes (len = {}, bits = {})",
                    len,
                    bits
                );
            }
        }
    }

    #[test]
    fn unpacked_signs_match_planes() {
        let mut rng = StdRng::seed_from_u64(0x51b5e2a9c04d8873);
        let scales = sorted_scales(&mut rng, 3);
        let data = gaussian_ish(&mut rng, 40);

        let mut codec = LqCodec::new(40, &scales).unwrap();
        codec.quantize(&data);

        let mut signs = vec![0i8; 3 * 40];
        codec.unpack_signs(&mut signs);

        let decoded = codec.dequantize();
        for i in 0..40 {
            let from_signs: f32 = (0..3)
                .map(|b| f32::from(signs[i * 3 + b]) * scales[b])
                .sum();
            assert!((from_signs - decoded[i]).abs() < 1e-6);
        }
    }
}
