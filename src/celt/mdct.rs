//! Implements the modified discrete cosine transform.
//!
//! This is a simple MDCT implementation that uses a N/4 complex FFT
//! to do most of the work. It should be relatively straightforward to
//! plug in pretty much any FFT here.
//!
//! The transform is built as a time-domain fold followed by a DCT-IV, with
//! the DCT-IV computed through a half-length complex FFT with pre- and
//! post-rotation. The algorithm is similar to (and inspired from) Fabrice
//! Bellard's MDCT implementation in FFMPEG, but has differences in signs,
//! ordering and scaling in many places.
//!
//! The window is applied only over the first and last `overlap` samples of
//! the lapped span (short-overlap lapped transform); the middle samples pass
//! unwindowed. The window is placed symmetrically inside the conceptual
//! length-2N frame, which is what makes the time-domain aliasing cancel
//! under overlap-add.

use std::f32::consts::PI;

use num_complex::Complex32;
use num_traits::Zero;

use crate::celt::kiss_fft::KissFft;

/// A planned MDCT producing `n` coefficients per block.
pub(crate) struct Mdct {
    n: usize,
    overlap: usize,
    fft: KissFft,
    /// DCT-IV pre-rotation, `exp(-i*pi*p/n)`.
    pre: Vec<Complex32>,
    /// DCT-IV post-rotation, `exp(-i*pi*(4r+1)/(4n))`.
    post: Vec<Complex32>,
    folded: Vec<f32>,
    dct_out: Vec<f32>,
    z_in: Vec<Complex32>,
    z_out: Vec<Complex32>,
}

/// DCT-IV through a half-length complex FFT with pre- and post-rotation.
fn dct4(
    fft: &KissFft,
    pre: &[Complex32],
    post: &[Complex32],
    input: &[f32],
    z_in: &mut [Complex32],
    z_out: &mut [Complex32],
    output: &mut [f32],
) {
    let n = input.len();
    let half = n / 2;

    (0..half).for_each(|p| {
        let z = Complex32::new(input[2 * p], input[n - 1 - 2 * p]);
        z_in[p] = z * pre[p];
    });

    fft.process(z_out, z_in);

    (0..half).for_each(|r| {
        let g = z_out[r] * post[r];
        output[2 * r] = g.re;
        output[n - 1 - 2 * r] = -g.im;
    });
}

impl Mdct {
    /// Plans an MDCT with `n` output coefficients and the given overlap.
    ///
    /// `n` must be even, at least as large as the overlap, and `n / 2` must
    /// factor into 2, 3 and 5.
    pub(crate) fn new(n: usize, overlap: usize) -> Self {
        debug_assert!(n % 2 == 0);
        debug_assert!(n >= overlap);
        let half = n / 2;

        let pre = (0..half)
            .map(|p| {
                let phase = -PI * (p as f32) / (n as f32);
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();
        let post = (0..half)
            .map(|r| {
                let phase = -PI * ((4 * r + 1) as f32) / ((4 * n) as f32);
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();

        Self {
            n,
            overlap,
            fft: KissFft::new(half),
            pre,
            post,
            folded: vec![0.0; n],
            dct_out: vec![0.0; n],
            z_in: vec![Complex32::zero(); half],
            z_out: vec![Complex32::zero(); half],
        }
    }

    /// The number of coefficients a block produces.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.n
    }

    /// Forward MDCT of one block.
    ///
    /// # Arguments
    /// * `input`  - `n + overlap` time samples (the lapped span).
    /// * `window` - The `overlap` rising window samples.
    /// * `output` - Receives the `n` coefficients.
    pub(crate) fn forward(&mut self, input: &[f32], window: &[f32], output: &mut [f32]) {
        let n = self.n;
        let ov = self.overlap;
        debug_assert_eq!(input.len(), n + ov);
        debug_assert_eq!(window.len(), ov);
        debug_assert_eq!(output.len(), n);

        // The windowed span sits centered in a conceptual frame of 2n
        // samples, padded with b zeros on both sides.
        let b = (n - ov) / 2;
        let windowed = |j: usize| -> f32 {
            // j indexes the conceptual frame.
            if j < b || j >= b + n + ov {
                0.0
            } else {
                let i = j - b;
                if i < ov {
                    window[i] * input[i]
                } else if i < n {
                    input[i]
                } else {
                    window[ov - 1 - (i - n)] * input[i]
                }
            }
        };

        // Time-domain fold, 2n -> n.
        let half = n / 2;
        (0..half).for_each(|p| {
            self.folded[p] = -windowed(3 * half - 1 - p) - windowed(3 * half + p);
        });
        (half..n).for_each(|p| {
            self.folded[p] = windowed(p - half) - windowed(3 * half - 1 - p);
        });

        dct4(
            &self.fft,
            &self.pre,
            &self.post,
            &self.folded,
            &mut self.z_in,
            &mut self.z_out,
            output,
        );

        // Keep coefficient magnitudes on the order of the input samples so
        // the log-domain energy range stays inside its clamps.
        let scale = 1.0 / n as f32;
        output.iter_mut().for_each(|v| *v *= scale);
    }

    /// Inverse MDCT of one block.
    ///
    /// # Arguments
    /// * `input`  - `n` coefficients.
    /// * `window` - The `overlap` rising window samples.
    /// * `output` - Receives the `n + overlap` windowed time samples of the
    ///              lapped span. The caller overlap-adds consecutive spans.
    pub(crate) fn inverse(&mut self, input: &[f32], window: &[f32], output: &mut [f32]) {
        let n = self.n;
        let ov = self.overlap;
        debug_assert_eq!(input.len(), n);
        debug_assert_eq!(window.len(), ov);
        debug_assert_eq!(output.len(), n + ov);

        dct4(
            &self.fft,
            &self.pre,
            &self.post,
            input,
            &mut self.z_in,
            &mut self.z_out,
            &mut self.dct_out,
        );
        let w = &self.dct_out;

        // Together with the forward scale this makes analysis followed by
        // synthesis the identity under overlap-add.
        let scale = 2.0;
        let b = (n - ov) / 2;
        let half = n / 2;

        // Unfold n -> 2n and pick out the non-zero span [b, b + n + ov),
        // applying the synthesis window over both overlap regions.
        let unfolded = |j: usize| -> f32 {
            if j < half {
                w[j + half]
            } else if j < 3 * half {
                -w[3 * half - 1 - j]
            } else {
                -w[j - 3 * half]
            }
        };

        (0..n + ov).for_each(|i| {
            let y = scale * unfolded(b + i);
            output[i] = if i < ov {
                window[i] * y
            } else if i < n {
                y
            } else {
                window[ov - 1 - (i - n)] * y
            };
        });
    }
}

/// Builds the Vorbis power-complementary window used for the lapped
/// overlap regions.
pub(crate) fn vorbis_window(overlap: usize) -> Vec<f32> {
    (0..overlap)
        .map(|i| {
            let x = PI * (i as f32 + 0.5) / (2.0 * overlap as f32);
            let inner = x.sin();
            (0.5 * PI * inner * inner).sin()
        })
        .collect()
}
