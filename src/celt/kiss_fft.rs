//! Implements the FFT used for the MDCT.
//!
//! A mixed-radix Fast Fourier Transform based up on the principle, "Keep It
//! Simple, Stupid." The code is originally from Mark Borgerding's KISS-FFT
//! but has been heavily modified to better suit the short-overlap MDCT: only
//! the forward transform is provided (the DCT-IV the MDCT is built on is its
//! own inverse), and the supported sizes factor into 2, 3, 4 and 5.

use std::f32::consts::PI;

use num_complex::Complex32;
use num_traits::Zero;

/// A planned complex FFT of a fixed size.
pub(crate) struct KissFft {
    n: usize,
    factors: Vec<usize>,
    twiddles: Vec<Complex32>,
}

impl KissFft {
    /// Plans a transform of the given size.
    ///
    /// The size must factor into powers of 2, 3 and 5.
    pub(crate) fn new(n: usize) -> Self {
        debug_assert!(n > 0);

        let mut factors = Vec::new();
        let mut remaining = n;
        for p in &[4_usize, 2, 3, 5] {
            while remaining % p == 0 {
                factors.push(*p);
                remaining /= p;
            }
        }
        debug_assert_eq!(remaining, 1, "FFT size must factor into 2, 3 and 5");

        let twiddles = (0..n)
            .map(|k| {
                let phase = -2.0 * PI * (k as f32) / (n as f32);
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();

        Self {
            n,
            factors,
            twiddles,
        }
    }

    /// Runs the forward transform. `input` and `output` must both hold
    /// exactly the planned size.
    pub(crate) fn process(&self, output: &mut [Complex32], input: &[Complex32]) {
        debug_assert_eq!(input.len(), self.n);
        debug_assert_eq!(output.len(), self.n);
        self.work(output, input, 1, 0);
    }

    /// Recursive decimation in time. The sub-transform at `factor_index`
    /// reads every `in_stride`-th input element.
    fn work(
        &self,
        output: &mut [Complex32],
        input: &[Complex32],
        in_stride: usize,
        factor_index: usize,
    ) {
        let n = output.len();
        if n == 1 {
            output[0] = input[0];
            return;
        }

        let p = self.factors[factor_index];
        let m = n / p;

        (0..p).for_each(|q| {
            self.work(
                &mut output[q * m..(q + 1) * m],
                &input[q * in_stride..],
                in_stride * p,
                factor_index + 1,
            );
        });

        // Combine the p sub-transforms. The radices are at most 5, so the
        // quadratic butterfly stays cheap.
        let tw_stride = self.n / n;
        let mut scratch = [Complex32::zero(); 5];

        (0..m).for_each(|j| {
            (0..p).for_each(|q| {
                scratch[q] = output[q * m + j];
            });
            (0..p).for_each(|r| {
                let mut acc = Complex32::zero();
                (0..p).for_each(|q| {
                    let idx = (q * (j + r * m) * tw_stride) % self.n;
                    acc += scratch[q] * self.twiddles[idx];
                });
                output[r * m + j] = acc;
            });
        });
    }
}
