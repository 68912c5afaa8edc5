//! Implements the log-domain energy envelope.
//!
//! Band energies are coded in base-2 log units (one unit is 6 dB) in three
//! stages: a coarse stage with 6 dB resolution driven by a two-tap predictor
//! and Laplace-coded residuals, a fine stage of uniform sub-quantizers, and
//! a finalizer that spends whatever bits are left after the shapes, one bit
//! per band and channel by priority.

use crate::celt::mode::{
    E_PROB_MODEL_INTER, E_PROB_MODEL_INTRA, MAX_BANDS, MAX_FINE_BITS, PRED_ALPHA, PRED_BETA,
    PRED_BETA_INTRA, SMALL_ENERGY_ICDF,
};
use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

/// The hard limits of the energy envelope in log2 units.
pub(crate) const ENERGY_FLOOR: f32 = -28.0;
pub(crate) const ENERGY_CEILING: f32 = 16.0;

fn prediction_coefficients(lm: usize, intra: bool) -> (f32, f32, &'static [u8; 42]) {
    if intra {
        (0.0, PRED_BETA_INTRA, &E_PROB_MODEL_INTRA[lm])
    } else {
        (PRED_ALPHA[lm], PRED_BETA[lm], &E_PROB_MODEL_INTER[lm])
    }
}

/// Decodes the coarse energy envelope into `old_e`.
///
/// Iterates band-major with the channels innermost, which is what keeps the
/// range coder state identical between mono and stereo paths.
pub(crate) fn unquant_coarse_energy(
    dec: &mut RangeDecoder,
    lm: usize,
    start: usize,
    end: usize,
    channels: usize,
    intra: bool,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    budget: u32,
) {
    let (alpha, beta, model) = prediction_coefficients(lm, intra);
    let mut prev = [0.0_f32; 2];

    (start..end).for_each(|band| {
        (0..channels).for_each(|c| {
            let available = budget.saturating_sub(dec.tell());
            let qi = if available >= 15 {
                let pi = 2 * usize::min(band, 20);
                dec.decode_laplace(u32::from(model[pi]) << 7, u32::from(model[pi + 1]) << 6)
            } else if available >= 2 {
                let v = dec.decode_icdf(&SMALL_ENERGY_ICDF, 2) as i32;
                (v >> 1) ^ -(v & 1)
            } else if available >= 1 {
                -(i32::from(dec.decode_bit_logp(1)))
            } else {
                -1
            };

            let q = qi as f32;
            let pred = alpha * f32::max(old_e[c][band], -9.0) + prev[c];
            old_e[c][band] = pred + q;
            prev[c] += beta * q;
        });
    });
}

/// Quantizes and encodes the coarse energy envelope.
///
/// `eb` holds the target band energies; `old_e` is updated to the quantized
/// envelope the decoder will reconstruct and `error` receives the residual
/// for the fine stage.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_coarse_energy(
    enc: &mut RangeEncoder,
    lm: usize,
    start: usize,
    end: usize,
    channels: usize,
    intra: bool,
    eb: &[[f32; MAX_BANDS]; 2],
    old_e: &mut [[f32; MAX_BANDS]; 2],
    error: &mut [[f32; MAX_BANDS]; 2],
    budget: u32,
) -> Result<(), EncoderError> {
    let (alpha, beta, model) = prediction_coefficients(lm, intra);
    let mut prev = [0.0_f32; 2];

    for band in start..end {
        for c in 0..channels {
            let available = budget.saturating_sub(enc.tell());
            let x = eb[c][band];
            let pred = alpha * f32::max(old_e[c][band], -9.0) + prev[c];
            let f = x - pred;
            let mut qi = (f + 0.5).floor() as i32;

            // Never go further below the floor than the prediction already is.
            qi = i32::max(qi, (ENERGY_FLOOR - pred).floor() as i32);

            if available >= 15 {
                let pi = 2 * usize::min(band, 20);
                enc.encode_laplace(
                    &mut qi,
                    u32::from(model[pi]) << 7,
                    u32::from(model[pi + 1]) << 6,
                )?;
            } else if available >= 2 {
                qi = qi.clamp(-1, 1);
                let sym = if qi < 0 { (-2 * qi - 1) as usize } else { (2 * qi) as usize };
                enc.encode_icdf(sym, &SMALL_ENERGY_ICDF, 2)?;
            } else if available >= 1 {
                qi = qi.clamp(-1, 0);
                enc.encode_bit_logp((-qi) as u32, 1)?;
            } else {
                qi = -1;
            }

            let q = qi as f32;
            error[c][band] = f - q;
            old_e[c][band] = pred + q;
            prev[c] += beta * q;
        }
    }

    Ok(())
}

/// Decodes the fine energy refinement.
pub(crate) fn unquant_fine_energy(
    dec: &mut RangeDecoder,
    start: usize,
    end: usize,
    channels: usize,
    fine_quant: &[i32; MAX_BANDS],
    old_e: &mut [[f32; MAX_BANDS]; 2],
) {
    (start..end).for_each(|band| {
        if fine_quant[band] <= 0 {
            return;
        }
        (0..channels).for_each(|c| {
            let q = dec.decode_bits(fine_quant[band] as u32);
            let offset = (q as f32 + 0.5) / (1 << fine_quant[band]) as f32 - 0.5;
            old_e[c][band] += offset;
        });
    });
}

/// Encodes the fine energy refinement and updates the residual.
pub(crate) fn quant_fine_energy(
    enc: &mut RangeEncoder,
    start: usize,
    end: usize,
    channels: usize,
    fine_quant: &[i32; MAX_BANDS],
    old_e: &mut [[f32; MAX_BANDS]; 2],
    error: &mut [[f32; MAX_BANDS]; 2],
) -> Result<(), EncoderError> {
    for band in start..end {
        if fine_quant[band] <= 0 {
            continue;
        }
        let frac = 1 << fine_quant[band];
        for c in 0..channels {
            let q = (((error[c][band] + 0.5) * frac as f32).floor() as i32).clamp(0, frac - 1);
            enc.encode_bits(q as u32, fine_quant[band] as u32)?;
            let offset = (q as f32 + 0.5) / frac as f32 - 0.5;
            error[c][band] -= offset;
            old_e[c][band] += offset;
        }
    }

    Ok(())
}

/// Spends the leftover bits on one extra energy bit per band, lowest
/// priority bands first.
pub(crate) fn unquant_energy_finalise(
    dec: &mut RangeDecoder,
    start: usize,
    end: usize,
    channels: usize,
    fine_quant: &[i32; MAX_BANDS],
    fine_priority: &[bool; MAX_BANDS],
    mut bits_left: i32,
    old_e: &mut [[f32; MAX_BANDS]; 2],
) {
    for prio in [false, true].iter() {
        for band in start..end {
            if bits_left < channels as i32 {
                return;
            }
            if fine_quant[band] >= MAX_FINE_BITS || fine_priority[band] != *prio {
                continue;
            }
            (0..channels).for_each(|c| {
                let q = dec.decode_bits(1);
                let offset = (q as f32 - 0.5) / (1 << (fine_quant[band] + 1)) as f32;
                old_e[c][band] += offset;
                bits_left -= 1;
            });
        }
    }
}

/// Encoder counterpart of the finalizer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_energy_finalise(
    enc: &mut RangeEncoder,
    start: usize,
    end: usize,
    channels: usize,
    fine_quant: &[i32; MAX_BANDS],
    fine_priority: &[bool; MAX_BANDS],
    mut bits_left: i32,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    error: &mut [[f32; MAX_BANDS]; 2],
) -> Result<(), EncoderError> {
    for prio in [false, true].iter() {
        for band in start..end {
            if bits_left < channels as i32 {
                return Ok(());
            }
            if fine_quant[band] >= MAX_FINE_BITS || fine_priority[band] != *prio {
                continue;
            }
            for c in 0..channels {
                let q = u32::from(error[c][band] >= 0.0);
                enc.encode_bits(q, 1)?;
                let offset = (q as f32 - 0.5) / (1 << (fine_quant[band] + 1)) as f32;
                old_e[c][band] += offset;
                error[c][band] -= offset;
                bits_left -= 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    #[test]
    fn test_coarse_roundtrip() {
        let mut rng = nanorand::WyRand::new_seed(42);

        for &(lm, channels, intra) in &[(0_usize, 1_usize, false), (2, 2, false), (3, 1, true)] {
            let mut eb = [[0.0_f32; MAX_BANDS]; 2];
            eb.iter_mut().for_each(|ch| {
                ch.iter_mut().for_each(|e| {
                    *e = rng.generate_range::<u32>(0, 2000) as f32 / 100.0 - 10.0;
                });
            });

            let mut buffer = vec![0_u8; 1024];
            let mut enc = RangeEncoder::new(&mut buffer);
            let mut enc_e = [[0.0_f32; MAX_BANDS]; 2];
            let mut error = [[0.0_f32; MAX_BANDS]; 2];
            let budget = enc.storage_bits();
            quant_coarse_energy(
                &mut enc, lm, 0, MAX_BANDS, channels, intra, &eb, &mut enc_e, &mut error, budget,
            )
            .unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            let mut dec_e = [[0.0_f32; MAX_BANDS]; 2];
            let budget = dec.storage_bits();
            unquant_coarse_energy(&mut dec, lm, 0, MAX_BANDS, channels, intra, &mut dec_e, budget);

            (0..channels).for_each(|c| {
                (0..MAX_BANDS).for_each(|band| {
                    assert!(
                        (enc_e[c][band] - dec_e[c][band]).abs() < 1e-5,
                        "band {} channel {}: {} instead of {}",
                        band,
                        c,
                        dec_e[c][band],
                        enc_e[c][band]
                    );
                    // Quantization error is at most half a step plus the
                    // fallback clamps, which the test budget never hits.
                    assert!((eb[c][band] - enc_e[c][band]).abs() <= 0.5 + 1e-5);
                });
            });
        }
    }

    #[test]
    fn test_fine_and_finalise_roundtrip() {
        let mut rng = nanorand::WyRand::new_seed(7);

        let mut fine_quant = [0_i32; MAX_BANDS];
        let mut fine_priority = [false; MAX_BANDS];
        fine_quant.iter_mut().for_each(|q| {
            *q = rng.generate_range::<u32>(0, 5) as i32;
        });
        fine_priority.iter_mut().for_each(|p| {
            *p = rng.generate_range::<u32>(0, 2) == 1;
        });

        let mut error = [[0.0_f32; MAX_BANDS]; 2];
        error.iter_mut().for_each(|ch| {
            ch.iter_mut().for_each(|e| {
                *e = rng.generate_range::<u32>(0, 1000) as f32 / 1000.0 - 0.5;
            });
        });

        let mut buffer = vec![0_u8; 256];
        let mut enc = RangeEncoder::new(&mut buffer);
        let mut enc_e = [[0.0_f32; MAX_BANDS]; 2];
        let mut enc_err = error;
        quant_fine_energy(&mut enc, 0, MAX_BANDS, 2, &fine_quant, &mut enc_e, &mut enc_err)
            .unwrap();
        quant_energy_finalise(
            &mut enc,
            0,
            MAX_BANDS,
            2,
            &fine_quant,
            &fine_priority,
            20,
            &mut enc_e,
            &mut enc_err,
        )
        .unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let mut dec_e = [[0.0_f32; MAX_BANDS]; 2];
        unquant_fine_energy(&mut dec, 0, MAX_BANDS, 2, &fine_quant, &mut dec_e);
        unquant_energy_finalise(
            &mut dec,
            0,
            MAX_BANDS,
            2,
            &fine_quant,
            &fine_priority,
            20,
            &mut dec_e,
        );

        (0..2).for_each(|c| {
            (0..MAX_BANDS).for_each(|band| {
                assert!((enc_e[c][band] - dec_e[c][band]).abs() < 1e-6);
            });
        });
    }
}
