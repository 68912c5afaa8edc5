//! Implements the per-band time-frequency resolution switching.
//!
//! Every band carries one flag that XOR-accumulates along the band axis, and
//! an optional `tf_select` bit picks one of two adjustment rows. The final
//! per-band values index into the adjustment table shared with the band
//! quantizer, which applies them as Haar recombination levels.

use crate::celt::mode::{MAX_BANDS, TF_SELECT_TABLE};
use crate::celt::Coder;
use crate::encoder_error::EncoderError;

/// Codes the per-band change flags and resolves them into adjustment levels.
///
/// On encode, `tf_res[start..end]` holds the change flags (0 or 1) chosen by
/// the analysis and `tf_select_hint` the preferred row; on both sides the
/// array is replaced by the table-resolved adjustments.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tf_code(
    coder: &mut Coder,
    start: usize,
    end: usize,
    lm: usize,
    transient: bool,
    budget: u32,
    tf_res: &mut [i8; MAX_BANDS],
    tf_select_hint: bool,
) -> Result<(), EncoderError> {
    let mut budget = budget;
    let mut tell = coder.tell();
    let mut logp: u32 = if transient { 2 } else { 4 };

    // Reserve the tf_select bit if it can fit.
    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    budget -= u32::from(tf_select_rsv);

    let mut curr = false;
    let mut tf_changed = false;
    for band in start..end {
        if tell + logp <= budget {
            let desired = coder.is_encoder() && tf_res[band] != 0;
            // The flags accumulate along the bands, so a run of equal flags
            // costs one cheap symbol per band.
            let mut sym = desired ^ curr;
            coder.bit_logp(&mut sym, logp)?;
            curr ^= sym;
            tf_changed |= curr;
            tell = coder.tell();
        }
        tf_res[band] = i8::from(curr);
        logp = if transient { 4 } else { 5 };
    }

    let row = &TF_SELECT_TABLE[lm];
    let base = 4 * usize::from(transient);
    let mut tf_select = false;
    if tf_select_rsv
        && row[base + usize::from(tf_changed)] != row[base + 2 + usize::from(tf_changed)]
    {
        tf_select = tf_select_hint;
        coder.bit_logp(&mut tf_select, 1)?;
    }

    (start..end).for_each(|band| {
        tf_res[band] = row[base + 2 * usize::from(tf_select) + usize::from(tf_res[band] != 0)];
    });

    Ok(())
}

/// Chooses per-band change flags for the encoder.
///
/// For each band the L1 sparsity of the normalized shape is compared against
/// the same shape after one Haar recombination step. A band that gets
/// noticeably sparser with the recombined resolution votes for a change.
/// With TF analysis disabled (low complexity), every flag stays clear.
pub(crate) fn tf_analysis(
    normalized: &[f32],
    band_offsets: &[(usize, usize)],
    transient: bool,
    tf_res: &mut [i8; MAX_BANDS],
) -> f32 {
    const LAMBDA: f32 = 0.05;

    let mut changed = 0_usize;
    let mut measured = 0_usize;

    band_offsets.iter().enumerate().for_each(|(band, &(off, n))| {
        tf_res[band] = 0;
        if n < 4 || n % 2 != 0 {
            return;
        }
        measured += 1;

        let x = &normalized[off..off + n];
        let l1_now: f32 = x.iter().map(|v| v.abs()).sum();

        // One Haar step without touching the source.
        let mut l1_alt = 0.0_f32;
        (0..n / 2).for_each(|j| {
            let a = std::f32::consts::FRAC_1_SQRT_2 * x[2 * j];
            let b = std::f32::consts::FRAC_1_SQRT_2 * x[2 * j + 1];
            l1_alt += (a + b).abs() + (a - b).abs();
        });

        if l1_alt + LAMBDA * l1_now < l1_now {
            tf_res[band] = 1;
            changed += 1;
        }
    });

    if measured == 0 {
        return 0.0;
    }

    // A rough estimate of how much the frame leans on time resolution: the
    // fraction of bands that preferred the alternative resolution, biased
    // up for transients.
    let fraction = changed as f32 / measured as f32;
    let base = if transient { 0.5 } else { 0.2 };
    (base + 0.5 * fraction).min(1.0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    #[test]
    fn test_tf_roundtrip() {
        for &(lm, transient) in &[(0_usize, false), (2, false), (3, true)] {
            let mut flags = [0_i8; MAX_BANDS];
            flags[3] = 1;
            flags[4] = 1;
            flags[10] = 1;

            let mut buffer = vec![0_u8; 64];
            let mut enc = RangeEncoder::new(&mut buffer);
            let mut enc_res = flags;
            {
                let mut coder = Coder::Enc(&mut enc);
                tf_code(&mut coder, 0, MAX_BANDS, lm, transient, 512, &mut enc_res, true)
                    .unwrap();
            }
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            let mut dec_res = [0_i8; MAX_BANDS];
            {
                let mut coder = Coder::Dec(&mut dec);
                tf_code(&mut coder, 0, MAX_BANDS, lm, transient, 512, &mut dec_res, false)
                    .unwrap();
            }

            assert_eq!(enc_res, dec_res, "lm {} transient {}", lm, transient);
        }
    }

    #[test]
    fn test_tf_values_come_from_table() {
        let mut buffer = vec![0_u8; 64];
        let mut enc = RangeEncoder::new(&mut buffer);
        let mut res = [0_i8; MAX_BANDS];
        res[5] = 1;
        {
            let mut coder = Coder::Enc(&mut enc);
            tf_code(&mut coder, 0, MAX_BANDS, 3, false, 512, &mut res, false).unwrap();
        }
        enc.done().unwrap();

        let row = &TF_SELECT_TABLE[3];
        res.iter().for_each(|&v| {
            assert!(row.contains(&v));
        });
    }

    #[test]
    fn test_analysis_prefers_change_for_impulsive_bands() {
        // A shape where adjacent pairs strongly correlate becomes sparser
        // after one recombination step.
        let mut x = vec![0.0_f32; 16];
        (0..8).for_each(|j| {
            x[2 * j] = 0.35;
            x[2 * j + 1] = 0.35;
        });

        let mut tf_res = [0_i8; MAX_BANDS];
        tf_analysis(&x, &[(0, 16)], false, &mut tf_res);
        assert_eq!(tf_res[0], 1);

        // A flat alternating shape has nothing to gain.
        let mut y = vec![0.0_f32; 16];
        (0..16).for_each(|j| {
            y[j] = if j % 2 == 0 { 0.35 } else { -0.35 };
        });
        // After the Haar step every pair lands on the difference leg with
        // the same magnitude, so the L1 stays put and the flag stays clear.
        let mut tf_res2 = [0_i8; MAX_BANDS];
        tf_analysis(&y, &[(0, 16)], false, &mut tf_res2);
        assert_eq!(tf_res2[0], 0);
    }
}
