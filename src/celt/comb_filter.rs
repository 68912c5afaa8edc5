//! Implements the pitch postfilter comb filter.

use crate::celt::mode::POSTFILTER_TAPS;

/// The smallest usable pitch period.
pub(crate) const COMBFILTER_MINPERIOD: usize = 15;
/// The largest pitch period the filter history accommodates.
pub(crate) const COMBFILTER_MAXPERIOD: usize = 1024;

#[inline(always)]
fn comb_filter_const_inplace(y: &mut [f32], y_offset: usize, t: usize, n: usize, g10: f32, g11: f32, g12: f32) {
    let mut x4 = y[y_offset - t - 2];
    let mut x3 = y[y_offset - t - 1];
    let mut x2 = y[y_offset - t];
    let mut x1 = y[y_offset - t + 1];
    (0..n).into_iter().for_each(|i| {
        let x0 = y[y_offset + i - t + 2];
        y[y_offset + i] = y[y_offset + i] + (g10 * x2) + (g11 * (x1 + x3)) + (g12 * (x0 + x4));
        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    });
}

/// Applies the 5-tap comb filter in place, crossfading from the old filter
/// parameters to the new ones over the first `overlap` samples.
///
/// The buffer must contain enough history before `y_offset` to cover the
/// larger of the two periods plus two samples.
///
/// # Arguments
/// * `y`        - Signal buffer, filtered in place starting at `y_offset`.
/// * `y_offset` - First sample to filter.
/// * `t0`       - Pitch period of the previous frame.
/// * `t1`       - Pitch period of this frame.
/// * `n`        - Number of samples to filter.
/// * `g0`       - Gain of the previous frame.
/// * `g1`       - Gain of this frame.
/// * `tapset0`  - Tapset of the previous frame.
/// * `tapset1`  - Tapset of this frame.
/// * `window`   - Rising window; its square drives the crossfade.
/// * `overlap`  - Length of the crossfade region.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::many_single_char_names)]
pub(crate) fn comb_filter_inplace(
    y: &mut [f32],
    y_offset: usize,
    mut t0: usize,
    mut t1: usize,
    n: usize,
    g0: f32,
    g1: f32,
    tapset0: usize,
    tapset1: usize,
    window: &[f32],
    mut overlap: usize,
) {
    if g0 == 0.0 && g1 == 0.0 {
        return;
    }

    // When the gain is zero, t0 and/or t1 is set to zero.
    // We need to have them be at least 2 to avoid processing garbage data.
    t0 = usize::max(t0, COMBFILTER_MINPERIOD);
    t1 = usize::max(t1, COMBFILTER_MINPERIOD);

    let g00 = g0 * POSTFILTER_TAPS[tapset0][0];
    let g01 = g0 * POSTFILTER_TAPS[tapset0][1];
    let g02 = g0 * POSTFILTER_TAPS[tapset0][2];
    let g10 = g1 * POSTFILTER_TAPS[tapset1][0];
    let g11 = g1 * POSTFILTER_TAPS[tapset1][1];
    let g12 = g1 * POSTFILTER_TAPS[tapset1][2];

    let mut x1 = y[y_offset - t1 + 1];
    let mut x2 = y[y_offset - t1];
    let mut x3 = y[y_offset - t1 - 1];
    let mut x4 = y[y_offset - t1 - 2];

    // If the filter didn't change, we don't need the overlap.
    if (g0 - g1).abs() < f32::EPSILON && t0 == t1 && tapset0 == tapset1 {
        overlap = 0;
    }

    let mut j = 0;
    (0..overlap).into_iter().for_each(|i| {
        let x0 = y[y_offset + i - t1 + 2];
        let f = window[i] * window[i];
        y[y_offset + i] = y[y_offset + i]
            + (((1.0 - f) * g00) * y[y_offset + i - t0])
            + (((1.0 - f) * g01) * (y[y_offset + i - t0 + 1] + y[y_offset + i - t0 - 1]))
            + (((1.0 - f) * g02) * (y[y_offset + i - t0 + 2] + y[y_offset + i - t0 - 2]))
            + ((f * g10) * x2)
            + ((f * g11) * (x1 + x3))
            + ((f * g12) * (x0 + x4));
        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;

        j += 1;
    });

    if g1 == 0.0 {
        return;
    }

    // Compute the part with the constant filter.
    comb_filter_const_inplace(y, y_offset + j, t1, n - j, g10, g11, g12);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    const T0: usize = 15;
    const T1: usize = 30;
    const G0: f32 = 0.0;
    const G1: f32 = 0.75;
    const SIZE: usize = 48;
    const N: usize = 16;
    const OVERLAP: usize = 4;

    const TEST_VECTOR: &[f32; N] = &[
        32.0, 33.0, 34.00001, 35.000042, 40.5, 42.25, 44.0, 45.75, 47.5, 49.25, 51.0, 52.75, 54.5,
        56.25, 58.0, 59.75,
    ];

    #[test]
    fn test_comb_filter_inplace() {
        let window: Vec<f32> = (0..OVERLAP)
            .map(|i| {
                let x = std::f32::consts::PI * (i as f32 + 0.5) / (2.0 * OVERLAP as f32);
                let inner = x.sin();
                (0.5 * std::f32::consts::PI * inner * inner).sin()
            })
            .collect();

        let mut output = [0_f32; SIZE];
        output
            .iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = i as f32);

        let offset = SIZE - N;
        comb_filter_inplace(&mut output, offset, T0, T1, N, G0, G1, 0, 0, &window, OVERLAP);

        (0..N).into_iter().for_each(|i| {
            assert!((output[offset + i] - TEST_VECTOR[i]).abs() < (TEST_VECTOR[i] * 0.01));
        });
    }

    #[test]
    fn test_zero_gain_is_identity() {
        let window = vec![0.5_f32; 8];
        let mut output = [0_f32; SIZE];
        output
            .iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = i as f32);
        let expected = output;

        comb_filter_inplace(&mut output, 32, 20, 20, 16, 0.0, 0.0, 0, 0, &window, 8);
        assert_eq!(output, expected);
    }
}
