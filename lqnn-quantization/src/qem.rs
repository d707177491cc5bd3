/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::views::{MatrixView, MatrixViewMut};
use lqnn::{ceil_div, Shape};
use thiserror::Error;

use crate::codec::{LqCodec, WORD_BITS};

// Descent hyperparameters. The signs are frozen during a descent step, so a
// small step size with L2 damping is enough; the outer loop refreshes the
// signs by re-encoding.
const DESCENT_LR: f32 = 0.001;
const L2_REG: f32 = 0.02;
const DESCENT_STEPS: usize = 8;
const BATCH_SIZE: usize = 64;

/// Errors detected while constructing a [`Qem`] problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QemError {
    #[error("bits per value must be in [1, 31], got {0}")]
    InvalidBits(usize),

    #[error("hidden size must be nonzero")]
    EmptyHidden,

    #[error("{name} has {len} elements, expected {expected}")]
    LengthMismatch {
        name: &'static str,
        len: usize,
        expected: usize,
    },
}

/// Quantization error minimization: fits `K` scales per output row so that
/// the LQ reconstruction of `source` approximates `target`.
///
/// `source` drives the encoding and `target` drives the loss. Both views are
/// `output_size x hidden_size`; they are the same buffer when training pure
/// reconstruction and differ when uptraining LQ-side inputs against a
/// full-precision reference.
///
/// Each [`Qem::fit`] epoch is one block-coordinate step: re-encode the source
/// row with the current (sorted) scales, hold the resulting sign planes
/// fixed, and run a few batched gradient-descent steps on the scales alone.
#[derive(Debug)]
pub struct Qem<'a> {
    source: MatrixView<'a, f32>,
    target: MatrixView<'a, f32>,
    scales: MatrixViewMut<'a, f32>,
    bits: usize,
    hidden_size: usize,
}

impl<'a> Qem<'a> {
    /// Set up a fitting problem over `output_size` independent rows.
    ///
    /// `scales` is `output_size x bits`, mutated in place. Rows are sorted
    /// ascending on construction; [`Qem::fit`] keeps them sorted.
    pub fn new(
        source: &'a [f32],
        target: &'a [f32],
        scales: &'a mut [f32],
        output_size: usize,
        hidden_size: usize,
        bits: usize,
    ) -> Result<Self, QemError> {
        if bits < 1 || bits >= WORD_BITS {
            return Err(QemError::InvalidBits(bits));
        }
        if hidden_size == 0 {
            return Err(QemError::EmptyHidden);
        }

        let check = |name: &'static str, len: usize, expected: usize| {
            if len != expected {
                Err(QemError::LengthMismatch {
                    name,
                    len,
                    expected,
                })
            } else {
                Ok(())
            }
        };
        check("source", source.len(), output_size * hidden_size)?;
        check("target", target.len(), output_size * hidden_size)?;
        check("scales", scales.len(), output_size * bits)?;

        // The length checks above make these infallible.
        let source = MatrixView::try_new(source, output_size, hidden_size).unwrap();
        let target = MatrixView::try_new(target, output_size, hidden_size).unwrap();
        let mut scales = MatrixViewMut::try_new(scales, output_size, bits).unwrap();

        for o in 0..output_size {
            sort_scales(scales.row_mut(o));
        }

        Ok(Self {
            source,
            target,
            scales,
            bits,
            hidden_size,
        })
    }

    /// Run `epochs` re-encode/descend rounds over every output row.
    pub fn fit(&mut self, epochs: usize) {
        for o in 0..self.source.nrows() {
            let source = self.source.row(o);
            let target = self.target.row(o);
            let scales = self.scales.row_mut(o);

            for _ in 0..epochs {
                sort_scales(scales);

                // Encode with the current scales; the codec owns the sign
                // planes for this round.
                let mut codec = codec_for(self.hidden_size, scales);
                codec.quantize(source);

                let mut signs = vec![0i8; self.bits * self.hidden_size];
                codec.unpack_signs(&mut signs);

                gradient_descent_scales(scales, &signs, target);
            }

            sort_scales(scales);
        }
    }

    /// Re-encode every source row with its final scales and pack the planes
    /// into `out`, `bits * ceil(hidden_size / 32)` words per row.
    ///
    /// # Panics
    ///
    /// Panics if `out.len()` does not match
    /// `output_size * bits * ceil(hidden_size / 32)`.
    pub fn fill_binary(&mut self, out: &mut [i32]) {
        let words = ceil_div(self.hidden_size, WORD_BITS);
        let row_words = self.bits * words;
        assert_eq!(out.len(), self.source.nrows() * row_words);

        for o in 0..self.source.nrows() {
            let mut codec = codec_for(self.hidden_size, self.scales.row_mut(o));
            codec.quantize(self.source.row(o));

            let row = &mut out[o * row_words..(o + 1) * row_words];
            for (dst, src) in std::iter::zip(row.iter_mut(), codec.planes().iter()) {
                *dst = *src as i32;
            }
        }
    }

    /// Reconstruction loss `Σ (target - dequantize(quantize(source)))²`
    /// summed over all rows with the current scales.
    pub fn loss(&mut self) -> f64 {
        let mut total = 0.0f64;
        for o in 0..self.source.nrows() {
            let mut codec = codec_for(self.hidden_size, self.scales.row_mut(o));
            codec.quantize(self.source.row(o));
            let decoded = codec.dequantize();

            for (x_hat, x) in std::iter::zip(decoded.iter(), self.target.row(o).iter()) {
                total += f64::from(x_hat - x).powi(2);
            }
        }
        total
    }
}

fn codec_for(hidden_size: usize, scales: &[f32]) -> LqCodec {
    // Bounds were validated in the constructor.
    LqCodec::new(hidden_size, scales).unwrap()
}

// Sort ascending, then break up exact duplicates: two equal scales collapse
// a pair of lattice levels and leave the encoder with an ambiguous midpoint.
fn sort_scales(scales: &mut [f32]) {
    scales.sort_by(f32::total_cmp);
    for b in 1..scales.len() {
        if scales[b] == scales[b - 1] {
            scales[b] = scales[b - 1] + f32::EPSILON * scales[b - 1].abs().max(1.0);
        }
    }
}

// Least-squares-by-gradient-descent on the scales with the sign planes held
// fixed: for each value, `err = x̂ - target` and each scale moves along its
// sign times the error, damped by L2.
fn gradient_descent_scales(scales: &mut [f32], signs: &[i8], target: &[f32]) {
    let bits = scales.len();
    let len = target.len();
    debug_assert_eq!(signs.len(), bits * len);

    let mut decoded = [0.0f32; BATCH_SIZE];

    for _ in 0..DESCENT_STEPS {
        for start in (0..len).step_by(BATCH_SIZE) {
            let size = BATCH_SIZE.min(len - start);

            // Dequantize the batch with the current scales.
            for i in 0..size {
                let row = &signs[(start + i) * bits..(start + i + 1) * bits];
                decoded[i] = std::iter::zip(row.iter(), scales.iter())
                    .map(|(sign, scale)| f32::from(*sign) * scale)
                    .sum();
            }

            for i in 0..size {
                let err = decoded[i] - target[start + i];
                let row = &signs[(start + i) * bits..(start + i + 1) * bits];
                for (scale, sign) in std::iter::zip(scales.iter_mut(), row.iter()) {
                    *scale -= DESCENT_LR * (f32::from(*sign) * err + L2_REG * *scale);
                }
            }
        }
    }
}

/// Plane words needed to binarize `output_size` rows of `hidden_size` values
/// at `bits` bits per value.
pub fn binary_len(output_size: usize, hidden_size: usize, bits: usize) -> usize {
    output_size * bits * ceil_div(hidden_size, WORD_BITS)
}

/// Shape of the packed weight planes tensor for one fully-connected layer.
pub fn binary_shape(output_size: usize, hidden_size: usize, bits: usize) -> Shape {
    Shape::from([output_size, bits, ceil_div(hidden_size, WORD_BITS)])
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn gaussian_ish(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| {
                let sum: f32 = (0..6).map(|_| rng.random::<f32>()).sum();
                sum - 3.0
            })
            .collect()
    }

    #[test]
    fn constructor_validates() {
        let data = vec![0.0f32; 8];
        let mut scales = vec![0.5f32; 2];
        assert_eq!(
            Qem::new(&data, &data, &mut scales, 1, 8, 0).unwrap_err(),
            QemError::InvalidBits(0)
        );
        assert_eq!(
            Qem::new(&data, &data, &mut scales, 1, 0, 2).unwrap_err(),
            QemError::EmptyHidden
        );
        assert_eq!(
            Qem::new(&data, &data, &mut scales, 2, 8, 2).unwrap_err(),
            QemError::LengthMismatch {
                name: "source",
                len: 8,
                expected: 16
            }
        );
    }

    #[test]
    fn constructor_sorts_scales() {
        let data = vec![0.0f32; 4];
        let mut scales = vec![0.9, 0.1, 0.5];
        let _ = Qem::new(&data, &data, &mut scales, 1, 4, 3).unwrap();
        assert_eq!(scales, vec![0.1, 0.5, 0.9]);
    }

    #[test]
    fn duplicate_scales_are_perturbed() {
        let mut scales = vec![0.5, 0.5, 0.5];
        sort_scales(&mut scales);
        assert!(scales[0] < scales[1] && scales[1] < scales[2]);
    }

    #[test]
    fn fit_reduces_reconstruction_loss() {
        let mut rng = StdRng::seed_from_u64(0xa0c2bb1744f3d5e6);
        let hidden = 512;
        let data = gaussian_ish(&mut rng, hidden);

        let mut scales: Vec<f32> = (0..2).map(|_| rng.random::<f32>()).collect();
        scales.sort_by(f32::total_cmp);

        let mut qem = Qem::new(&data, &data, &mut scales, 1, hidden, 2).unwrap();
        let initial = qem.loss();
        qem.fit(25);
        let trained = qem.loss();

        assert!(
            trained < 0.9 * initial,
            "loss did not drop by 10%: {} -> {}",
            initial,
            trained
        );
        assert!(scales.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn fit_handles_multiple_rows_independently() {
        let mut rng = StdRng::seed_from_u64(0x7be0f4419d26c8a1);
        let hidden = 96;
        let rows = 3;
        let data = gaussian_ish(&mut rng, rows * hidden);

        let mut scales: Vec<f32> = (0..rows * 2).map(|_| rng.random::<f32>()).collect();
        let mut qem = Qem::new(&data, &data, &mut scales, rows, hidden, 2).unwrap();
        let initial = qem.loss();
        qem.fit(25);
        assert!(qem.loss() < initial);

        for row in scales.chunks_exact(2) {
            assert!(row[0] <= row[1]);
        }
    }

    #[test]
    fn fill_binary_matches_codec_output() {
        let mut rng = StdRng::seed_from_u64(0x90df52c3381aeb74);
        let hidden = 40;
        let data = gaussian_ish(&mut rng, hidden);
        let mut scales = vec![0.25f32, 0.75f32];

        let mut qem = Qem::new(&data, &data, &mut scales, 1, hidden, 2).unwrap();
        let mut packed = vec![0i32; binary_len(1, hidden, 2)];
        qem.fill_binary(&mut packed);

        let mut codec = LqCodec::new(hidden, &scales).unwrap();
        codec.quantize(&data);
        let expected: Vec<i32> = codec.planes().iter().map(|w| *w as i32).collect();
        assert_eq!(packed, expected);
    }

    #[test]
    fn binary_shape_rounds_words_up() {
        assert_eq!(binary_shape(4, 5, 3).dims(), &[4, 3, 1]);
        assert_eq!(binary_shape(2, 64, 2).dims(), &[2, 2, 2]);
        assert_eq!(binary_shape(1, 65, 1).dims(), &[1, 1, 3]);
    }
}
