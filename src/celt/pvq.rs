//! Implements the pyramid vector quantizer.
//!
//! Band shapes are quantized by placing K signed integer pulses in N
//! positions and transmitting the codeword index. A length preserving
//! "exp-rotation" spreads the pulses before the search and is undone with the
//! opposite direction after reconstruction, so tonal bands do not collapse
//! into isolated spectral lines.

use std::f32::consts::PI;

use crate::celt::cwrs::{cwrsi, icwrs, CwrsTable};
use crate::decoder_error::DecoderError;
use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder};

/// The largest partition a single PVQ codeword can cover. Bands wider than
/// this are split before quantization.
pub(crate) const MAX_PVQ_SIZE: usize = 208;

/// How aggressively the rotation spreads pulses across the band.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Spread {
    /// No rotation.
    None = 0,
    /// Light spreading.
    Light = 1,
    /// Normal spreading.
    Normal = 2,
    /// Aggressive spreading.
    Aggressive = 3,
}

impl From<u32> for Spread {
    fn from(v: u32) -> Self {
        match v {
            0 => Spread::None,
            1 => Spread::Light,
            2 => Spread::Normal,
            _ => Spread::Aggressive,
        }
    }
}

const SPREAD_FACTOR: [usize; 3] = [15, 10, 5];

fn exp_rotation1(x: &mut [f32], stride: usize, c: f32, s: f32) {
    let len = x.len();
    let ms = -s;

    (0..len - stride).for_each(|i| {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    });

    (0..len.saturating_sub(2 * stride)).rev().for_each(|i| {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    });
}

/// Applies the length preserving spreading rotation.
///
/// The encoder applies it with `dir = -1` before the pulse search and the
/// decoder (and the encoder's reconstruction) with `dir = 1`, so both sides
/// observe identical band shapes.
pub(crate) fn exp_rotation(x: &mut [f32], dir: i32, b: usize, k: usize, spread: Spread) {
    let len = x.len();
    if 2 * k >= len || spread == Spread::None || len < 3 {
        return;
    }

    let factor = SPREAD_FACTOR[spread as usize - 1];
    let gain = len as f32 / (len + factor * k) as f32;
    let theta = 0.5 * gain * gain;
    let c = (0.5 * PI * theta).cos();
    let s = (0.5 * PI * (1.0 - theta)).cos();

    let mut stride2 = 0;
    if len >= 8 * b {
        // This is just a simple (equivalent) way of computing
        // sqrt(len / b) with rounding.
        stride2 = 1;
        while (stride2 * stride2 + stride2) * b + (b >> 2) < len {
            stride2 += 1;
        }
    }

    let len_per = len / b;
    (0..b).for_each(|i| {
        let seg = &mut x[i * len_per..(i + 1) * len_per];
        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(seg, stride2, s, c);
            }
            exp_rotation1(seg, 1, c, s);
        } else {
            exp_rotation1(seg, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(seg, stride2, s, -c);
            }
        }
    });
}

/// Scales the integer pulse vector to a float shape with the requested gain.
fn normalise_residual(pulses: &[i32], x: &mut [f32], ryy: f32, gain: f32) {
    let g = gain / ryy.sqrt();
    x.iter_mut().zip(pulses.iter()).for_each(|(xi, &p)| {
        *xi = g * p as f32;
    });
}

/// Records which of the `b` sub-blocks of the partition received at least one
/// pulse.
pub(crate) fn extract_collapse_mask(pulses: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }
    let n0 = pulses.len() / b;
    let mut mask = 0_u32;
    (0..b).for_each(|i| {
        let any = pulses[i * n0..(i + 1) * n0].iter().any(|&p| p != 0);
        mask |= u32::from(any) << i;
    });
    mask
}

/// Searches the K-pulse vector that best matches the input shape.
///
/// The input is never written to; the search works on a local magnitude copy
/// and restores the input signs at the end. Returns the squared norm of the
/// pulse vector.
fn op_pvq_search(x: &[f32], k: usize, iy: &mut [i32]) -> f32 {
    let n = x.len();
    debug_assert!(n <= MAX_PVQ_SIZE);

    let mut abs_x = [0.0_f32; MAX_PVQ_SIZE];
    let mut y = [0.0_f32; MAX_PVQ_SIZE];
    let mut sum = 0.0_f32;

    (0..n).for_each(|j| {
        abs_x[j] = x[j].abs();
        sum += abs_x[j];
    });
    iy[..n].iter_mut().for_each(|p| *p = 0);

    let mut xy = 0.0_f32;
    let mut yy = 0.0_f32;
    let mut pulses_left = k;

    if sum > 1e-15 {
        // Put at least one pulse per projected position to cut down the
        // number of greedy refinement iterations.
        if k > (n >> 1) {
            let rcp = (k as f32 - 0.8) / sum;
            (0..n).for_each(|j| {
                let p = (rcp * abs_x[j]).floor() as i32;
                iy[j] = p;
                y[j] = p as f32;
                yy += y[j] * y[j];
                xy += abs_x[j] * y[j];
                pulses_left -= p as usize;
            });
        }
    } else {
        // Zero input; any codeword is as good as any other.
        iy[0] = k as i32;
        return (k * k) as f32;
    }

    // A projection overshoot would be a bug in the projection above; a large
    // remainder just means a slow greedy loop.
    if pulses_left > n + 3 {
        let (best, _) = abs_x[..n]
            .iter()
            .enumerate()
            .fold((0, -1.0_f32), |(bj, bv), (j, &v)| {
                if v > bv {
                    (j, v)
                } else {
                    (bj, bv)
                }
            });
        let p = pulses_left as i32;
        iy[best] += p;
        yy += 2.0 * y[best] * p as f32 + (p * p) as f32;
        xy += abs_x[best] * p as f32;
        y[best] += p as f32;
        pulses_left = 0;
    }

    (0..pulses_left).for_each(|_| {
        let mut best_j = 0;
        let mut best_num = -1.0_f32;
        let mut best_den = 0.0_f32;

        (0..n).for_each(|j| {
            let num = (xy + abs_x[j]) * (xy + abs_x[j]);
            let den = yy + 2.0 * y[j] + 1.0;
            let lhs = num * best_den;
            let rhs = best_num * den;
            // Ties go to the position closest to the band centre.
            let closer = (2 * j as i32 - n as i32 + 1).abs()
                < (2 * best_j as i32 - n as i32 + 1).abs();
            if lhs > rhs || (lhs == rhs && closer) {
                best_num = num;
                best_den = den;
                best_j = j;
            }
        });

        xy += abs_x[best_j];
        yy += 2.0 * y[best_j] + 1.0;
        y[best_j] += 1.0;
        iy[best_j] += 1;
    });

    // Restore the input signs.
    (0..n).for_each(|j| {
        if x[j] < 0.0 {
            iy[j] = -iy[j];
        }
    });

    let mut ryy = 0.0_f32;
    (0..n).for_each(|j| {
        ryy += (iy[j] * iy[j]) as f32;
    });
    ryy
}

/// Quantizes the band shape with K pulses and writes the codeword index.
///
/// The buffer is overwritten with the reconstructed shape so later bands fold
/// from exactly what the decoder will see. Returns the collapse mask.
#[allow(clippy::too_many_arguments)]
pub(crate) fn alg_quant(
    x: &mut [f32],
    k: usize,
    spread: Spread,
    b: usize,
    enc: &mut RangeEncoder,
    table: &CwrsTable,
    gain: f32,
) -> Result<u32, EncoderError> {
    debug_assert!(k > 0);
    debug_assert!(x.len() > 1);

    exp_rotation(x, -1, b, k, spread);

    let mut iy = [0_i32; MAX_PVQ_SIZE];
    let n = x.len();
    let ryy = op_pvq_search(x, k, &mut iy[..n]);

    let (index, total) = icwrs(table, &iy[..n]);
    debug_assert!(total <= u64::from(u32::MAX));
    enc.encode_uint(index as u32, total as u32)?;

    normalise_residual(&iy[..n], x, ryy, gain);
    exp_rotation(x, 1, b, k, spread);

    Ok(extract_collapse_mask(&iy[..n], b))
}

/// Decodes a codeword index and reconstructs the unit norm band shape.
///
/// Returns the collapse mask.
#[allow(clippy::too_many_arguments)]
pub(crate) fn alg_unquant(
    x: &mut [f32],
    k: usize,
    spread: Spread,
    b: usize,
    dec: &mut RangeDecoder,
    table: &CwrsTable,
    gain: f32,
) -> Result<u32, DecoderError> {
    debug_assert!(k > 0);
    if x.len() < 2 {
        return Err(DecoderError::InternalError(
            "cannot split a band of less than two samples",
        ));
    }

    let n = x.len();
    let total = table.v(n, k);
    debug_assert!(total <= u64::from(u32::MAX));

    let index = dec.decode_uint(total as u32);
    let mut iy = [0_i32; MAX_PVQ_SIZE];
    cwrsi(table, k, u64::from(index), &mut iy[..n]);

    let mut ryy = 0.0_f32;
    (0..n).for_each(|j| {
        ryy += (iy[j] * iy[j]) as f32;
    });

    normalise_residual(&iy[..n], x, ryy, gain);
    exp_rotation(x, 1, b, k, spread);

    Ok(extract_collapse_mask(&iy[..n], b))
}

/// Renormalizes a vector to the requested gain.
pub(crate) fn renormalise_vector(x: &mut [f32], gain: f32) {
    let e: f32 = 1e-27 + x.iter().map(|v| v * v).sum::<f32>();
    let g = gain / e.sqrt();
    x.iter_mut().for_each(|v| *v *= g);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    fn norm(x: &[f32]) -> f32 {
        x.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    #[test]
    fn test_exp_rotation_preserves_length() {
        let mut rng = nanorand::WyRand::new_seed(7);
        let mut x = [0.0_f32; 32];
        x.iter_mut()
            .for_each(|v| *v = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0);

        let before = norm(&x);
        exp_rotation(&mut x, -1, 1, 3, Spread::Normal);
        let rotated = norm(&x);
        assert!((before - rotated).abs() < 1e-4 * before.max(1.0));

        exp_rotation(&mut x, 1, 1, 3, Spread::Normal);
        assert!((before - norm(&x)).abs() < 1e-4 * before.max(1.0));
    }

    #[test]
    fn test_exp_rotation_is_inverted_by_opposite_direction() {
        let mut rng = nanorand::WyRand::new_seed(11);
        let mut x = [0.0_f32; 24];
        x.iter_mut()
            .for_each(|v| *v = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0);
        let original = x;

        exp_rotation(&mut x, -1, 2, 2, Spread::Aggressive);
        exp_rotation(&mut x, 1, 2, 2, Spread::Aggressive);

        x.iter().zip(original.iter()).for_each(|(a, b)| {
            assert!((a - b).abs() < 1e-5);
        });
    }

    #[test]
    fn test_search_does_not_mutate_input() {
        let x = [0.5_f32, -0.5, 0.5, -0.5];
        let copy = x;
        let mut iy = [0_i32; 4];
        op_pvq_search(&x, 4, &mut iy);
        assert_eq!(x, copy);
        assert_eq!(iy.iter().map(|p| p.unsigned_abs()).sum::<u32>(), 4);
    }

    #[test]
    fn test_search_matches_signs() {
        let x = [0.9_f32, -0.1, -0.9, 0.1];
        let mut iy = [0_i32; 4];
        op_pvq_search(&x, 2, &mut iy);
        assert!(iy[0] > 0);
        assert!(iy[2] < 0);
    }

    #[test]
    fn test_quant_unquant_roundtrip_is_unit_norm() {
        let table = CwrsTable::new(32, 32);
        let mut rng = nanorand::WyRand::new_seed(23);

        for _ in 0..200 {
            let n = rng.generate_range::<usize>(2, 25);
            let k = rng.generate_range::<usize>(1, 17);
            let spread = Spread::from(rng.generate_range::<u32>(0, 4));

            let mut x = vec![0.0_f32; n];
            x.iter_mut()
                .for_each(|v| *v = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0);
            renormalise_vector(&mut x, 1.0);

            let mut buffer = vec![0_u8; 128];
            let mut enc = RangeEncoder::new(&mut buffer);
            let mut encoded = x.clone();
            alg_quant(&mut encoded, k, spread, 1, &mut enc, &table, 1.0).unwrap();
            enc.done().unwrap();
            drop(enc);

            assert!((norm(&encoded) - 1.0).abs() < 1e-2);

            let mut dec = RangeDecoder::new(&buffer);
            let mut decoded = vec![0.0_f32; n];
            alg_unquant(&mut decoded, k, spread, 1, &mut dec, &table, 1.0).unwrap();

            assert!((norm(&decoded) - 1.0).abs() < 1e-2);
            decoded.iter().zip(encoded.iter()).for_each(|(a, b)| {
                assert!((a - b).abs() < 1e-5, "decoder and encoder shapes diverged");
            });
        }
    }

    #[test]
    fn test_collapse_mask() {
        let pulses = [1, 0, 0, 0, 0, 0, -2, 0];
        assert_eq!(extract_collapse_mask(&pulses, 1), 1);
        assert_eq!(extract_collapse_mask(&pulses, 2), 0b11);
        assert_eq!(extract_collapse_mask(&pulses, 4), 0b1001);
    }
}
