//! Implements the band shape quantization.
//!
//! Every coded band is normalized to unit norm, optionally split into
//! mid/side (stereo) or halves (wide bands), and quantized with the pyramid
//! vector quantizer. Bands without pulses fold a copy of previously decoded
//! spectrum, driven by the frame's LCG seed, so they never go to digital
//! silence. The encoder and the decoder run the identical control flow with
//! every coded decision routed through [`Coder`].

use crate::celt::mode::{CeltMode, EBANDS, LOG_N, MAX_BANDS};
use crate::celt::pvq::{alg_quant, alg_unquant, renormalise_vector, Spread, MAX_PVQ_SIZE};
use crate::celt::Coder;
use crate::encoder_error::EncoderError;
use crate::math::{bitexact_cos, bitexact_log2tan, fast_atan2, frac_mul16};
use crate::range_coder::BITRES;

/// Resolution offset of the split angle for regular bands.
const QTHETA_OFFSET: i32 = 4;
/// Resolution offset for two-sample stereo bands.
const QTHETA_OFFSET_TWOPHASE: i32 = 16;

const EXP2_TABLE8: [i32; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];

const BIT_INTERLEAVE_TABLE: [u32; 16] = [0, 1, 1, 1, 2, 3, 3, 3, 2, 3, 3, 3, 2, 3, 3, 3];
const BIT_DEINTERLEAVE_TABLE: [u32; 16] = [
    0x00, 0x03, 0x0C, 0x0F, 0x30, 0x33, 0x3C, 0x3F, 0xC0, 0xC3, 0xCC, 0xCF, 0xF0, 0xF3, 0xFC,
    0xFF,
];

/// Hadamard reordering per stride, strides 2, 4 and 8.
const ORDERY_TABLE: [usize; 14] = [1, 0, 3, 0, 2, 1, 7, 0, 4, 3, 6, 1, 5, 2];

/// Advances the folding RNG.
#[inline(always)]
pub(crate) fn lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}

fn isqrt(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    let mut x = (n as f64).sqrt() as u32;
    // The float estimate can be off by one in either direction.
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    while x * x > n {
        x -= 1;
    }
    x
}

/// Computes per-band amplitudes and log energies of one channel.
pub(crate) fn compute_band_energies(
    x: &[f32],
    lm: usize,
    end: usize,
    amps: &mut [f32; MAX_BANDS],
    log_e: &mut [f32; MAX_BANDS],
) {
    (0..end).for_each(|band| {
        let lo = EBANDS[band] << lm;
        let hi = EBANDS[band + 1] << lm;
        let sum: f32 = 1e-27 + x[lo..hi].iter().map(|v| v * v).sum::<f32>();
        amps[band] = sum.sqrt();
        log_e[band] = crate::math::fast_log2(amps[band]);
    });
}

/// Scales every coded band of `x` to unit norm.
pub(crate) fn normalise_bands(x: &mut [f32], lm: usize, end: usize, amps: &[f32; MAX_BANDS]) {
    (0..end).for_each(|band| {
        let lo = EBANDS[band] << lm;
        let hi = EBANDS[band + 1] << lm;
        let g = 1.0 / (1e-27 + amps[band]);
        x[lo..hi].iter_mut().for_each(|v| *v *= g);
    });
}

/// Applies the decoded energy envelope to the unit norm shapes.
pub(crate) fn denormalise_bands(
    x: &mut [f32],
    lm: usize,
    start: usize,
    end: usize,
    log_e: &[f32; MAX_BANDS],
) {
    x[..EBANDS[start] << lm].iter_mut().for_each(|v| *v = 0.0);
    (start..end).for_each(|band| {
        let lo = EBANDS[band] << lm;
        let hi = EBANDS[band + 1] << lm;
        let g = crate::math::fast_exp2(f32::min(log_e[band], 16.0));
        x[lo..hi].iter_mut().for_each(|v| *v *= g);
    });
    x[EBANDS[end] << lm..].iter_mut().for_each(|v| *v = 0.0);
}

/// One level of the Haar transform over interleaved blocks.
pub(crate) fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    let n0 = n0 >> 1;
    (0..stride).for_each(|i| {
        (0..n0).for_each(|j| {
            let a = std::f32::consts::FRAC_1_SQRT_2 * x[stride * 2 * j + i];
            let b = std::f32::consts::FRAC_1_SQRT_2 * x[stride * (2 * j + 1) + i];
            x[stride * 2 * j + i] = a + b;
            x[stride * (2 * j + 1) + i] = a - b;
        });
    });
}

fn deinterleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    debug_assert!(n <= MAX_PVQ_SIZE);
    let mut tmp = [0.0_f32; MAX_PVQ_SIZE];

    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..2 * stride - 2];
        (0..stride).for_each(|i| {
            (0..n0).for_each(|j| {
                tmp[ordery[i] * n0 + j] = x[j * stride + i];
            });
        });
    } else {
        (0..stride).for_each(|i| {
            (0..n0).for_each(|j| {
                tmp[i * n0 + j] = x[j * stride + i];
            });
        });
    }
    x[..n].copy_from_slice(&tmp[..n]);
}

fn interleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    debug_assert!(n <= MAX_PVQ_SIZE);
    let mut tmp = [0.0_f32; MAX_PVQ_SIZE];

    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..2 * stride - 2];
        (0..stride).for_each(|i| {
            (0..n0).for_each(|j| {
                tmp[j * stride + i] = x[ordery[i] * n0 + j];
            });
        });
    } else {
        (0..stride).for_each(|i| {
            (0..n0).for_each(|j| {
                tmp[j * stride + i] = x[i * n0 + j];
            });
        });
    }
    x[..n].copy_from_slice(&tmp[..n]);
}

/// Mixes the side into the mid for a band that switches to intensity
/// stereo. Encoder only; the decoder reconstructs from the mid alone.
fn intensity_stereo(x: &mut [f32], y: &[f32], left_amp: f32, right_amp: f32) {
    let norm = 1e-15 + (1e-15 + left_amp * left_amp + right_amp * right_amp).sqrt();
    let a1 = left_amp / norm;
    let a2 = right_amp / norm;
    x.iter_mut().zip(y.iter()).for_each(|(l, &r)| {
        *l = a1 * *l + a2 * r;
    });
}

fn stereo_split(x: &mut [f32], y: &mut [f32]) {
    x.iter_mut().zip(y.iter_mut()).for_each(|(l, r)| {
        let m = std::f32::consts::FRAC_1_SQRT_2 * *l;
        let s = std::f32::consts::FRAC_1_SQRT_2 * *r;
        *l = m + s;
        *r = m - s;
    });
}

fn stereo_merge(x: &mut [f32], y: &mut [f32], mid: f32) {
    let mut xp = 0.0_f32;
    let mut side = 0.0_f32;
    x.iter().zip(y.iter()).for_each(|(&l, &r)| {
        xp += l * r;
        side += r * r;
    });
    // Compensating for the mid normalization.
    xp *= mid;
    let e_left = mid * mid + side - 2.0 * xp;
    let e_right = mid * mid + side + 2.0 * xp;
    if e_right < 6e-4 || e_left < 6e-4 {
        y.copy_from_slice(x);
        return;
    }

    let lgain = 1.0 / e_left.sqrt();
    let rgain = 1.0 / e_right.sqrt();
    x.iter_mut().zip(y.iter_mut()).for_each(|(l, r)| {
        let m = mid * *l;
        let s = *r;
        *l = lgain * (m - s);
        *r = rgain * (m + s);
    });
}

/// The measured split angle in Q14, `16384` meaning all side.
fn stereo_itheta(x: &[f32], y: &[f32], stereo: bool) -> i32 {
    let mut e_mid = 1e-15_f32;
    let mut e_side = 1e-15_f32;
    if stereo {
        x.iter().zip(y.iter()).for_each(|(&l, &r)| {
            let m = 0.5 * (l + r);
            let s = 0.5 * (l - r);
            e_mid += m * m;
            e_side += s * s;
        });
    } else {
        e_mid += crate::math::inner_prod(x, x);
        e_side += crate::math::inner_prod(y, y);
    }
    let theta = fast_atan2(e_side.sqrt(), e_mid.sqrt());
    (0.5 + 16384.0 * 0.636_619_77 * theta).floor() as i32
}

fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    let mut n2 = 2 * n as i32 - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }
    // The upper limit ensures a stereo split with itheta == 16384 still has
    // enough bits for at least one pulse in the side, which never folds.
    let mut qb = (b + n2 * offset) / n2;
    qb = i32::min(b - pulse_cap - (4 << BITRES), qb);
    qb = i32::min(8 << BITRES, qb);

    if qb < (1 << BITRES >> 1) {
        1
    } else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        ((qn + 1) >> 1) << 1
    }
}

/// Shared state of one `quant_all_bands` run.
struct BandCtx<'m> {
    mode: &'m CeltMode,
    band: usize,
    intensity: usize,
    spread: Spread,
    tf_change: i8,
    remaining_bits: i32,
    seed: u32,
    disable_inv: bool,
    /// Linear band amplitudes per channel, for the intensity downmix.
    band_amps: [[f32; MAX_BANDS]; 2],
}

struct SplitParams {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Quantizes or decodes the split angle between two partitions.
#[allow(clippy::too_many_arguments)]
fn compute_theta(
    ctx: &mut BandCtx,
    coder: &mut Coder,
    x: &mut [f32],
    y: &mut [f32],
    b: &mut i32,
    b_blocks: usize,
    b0: usize,
    lm: i32,
    stereo: bool,
    fill: &mut u32,
) -> Result<SplitParams, EncoderError> {
    let n = x.len();
    let pulse_cap = LOG_N[ctx.band] + (lm << BITRES);
    let offset = (pulse_cap >> 1)
        - if stereo && n == 2 {
            QTHETA_OFFSET_TWOPHASE
        } else {
            QTHETA_OFFSET
        };
    let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
    if stereo && ctx.band >= ctx.intensity {
        qn = 1;
    }

    let mut itheta = if coder.is_encoder() {
        stereo_itheta(x, y, stereo)
    } else {
        0
    };

    let tell = coder.tell_frac() as i32;
    let mut inv = false;

    if qn != 1 {
        if coder.is_encoder() {
            itheta = (itheta * qn + 8192) >> 14;
        }

        // Entropy coding of the angle. We use a uniform pdf for the time
        // split, a step for stereo, and a triangular one for the rest.
        if stereo && n > 2 {
            let p0: u32 = 3;
            let x0 = (qn / 2) as u32;
            let ft = p0 * (x0 + 1) + x0;
            match coder {
                Coder::Enc(enc) => {
                    let xi = itheta as u32;
                    let (fl, fh) = if xi <= x0 {
                        (p0 * xi, p0 * (xi + 1))
                    } else {
                        ((xi - 1 - x0) + (x0 + 1) * p0, (xi - x0) + (x0 + 1) * p0)
                    };
                    enc.encode(fl, fh, ft)?;
                }
                Coder::Dec(dec) => {
                    let fs = dec.decode(ft);
                    let xi = if fs < (x0 + 1) * p0 {
                        fs / p0
                    } else {
                        x0 + 1 + (fs - (x0 + 1) * p0)
                    };
                    let (fl, fh) = if xi <= x0 {
                        (p0 * xi, p0 * (xi + 1))
                    } else {
                        ((xi - 1 - x0) + (x0 + 1) * p0, (xi - x0) + (x0 + 1) * p0)
                    };
                    dec.update(fl, fh, ft);
                    itheta = xi as i32;
                }
            }
        } else if b0 > 1 || stereo {
            // Uniform pdf.
            let mut value = itheta as u32;
            coder.uniform(&mut value, qn as u32 + 1)?;
            itheta = value as i32;
        } else {
            // Triangular pdf.
            let half = qn >> 1;
            let ft = ((half + 1) * (half + 1)) as u32;
            match coder {
                Coder::Enc(enc) => {
                    let (fl, fs) = if itheta <= half {
                        ((itheta * (itheta + 1) >> 1) as u32, (itheta + 1) as u32)
                    } else {
                        (
                            ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1) as u32,
                            (qn + 1 - itheta) as u32,
                        )
                    };
                    enc.encode(fl, fl + fs, ft)?;
                }
                Coder::Dec(dec) => {
                    let fm = dec.decode(ft);
                    let (fl, fs) = if fm < ((half * (half + 1)) >> 1) as u32 {
                        itheta = ((isqrt(8 * fm + 1) as i32) - 1) >> 1;
                        ((itheta * (itheta + 1) >> 1) as u32, (itheta + 1) as u32)
                    } else {
                        itheta = (2 * (qn + 1) - isqrt(8 * (ft - fm - 1) + 1) as i32) >> 1;
                        (
                            ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1) as u32,
                            (qn + 1 - itheta) as u32,
                        )
                    };
                    dec.update(fl, fl + fs, ft);
                }
            }
        }

        itheta = itheta * 16384 / qn;
        if coder.is_encoder() && stereo {
            if itheta == 0 {
                intensity_stereo(
                    x,
                    y,
                    ctx.band_amps[0][ctx.band],
                    ctx.band_amps[1][ctx.band],
                );
            } else {
                stereo_split(x, y);
            }
        }
    } else if stereo {
        if coder.is_encoder() {
            inv = itheta > 8192 && !ctx.disable_inv;
            if inv {
                y.iter_mut().for_each(|v| *v = -*v);
            }
            intensity_stereo(
                x,
                y,
                ctx.band_amps[0][ctx.band],
                ctx.band_amps[1][ctx.band],
            );
        }
        if *b > 2 << BITRES && ctx.remaining_bits > 2 << BITRES {
            coder.bit_logp(&mut inv, 2)?;
        } else {
            inv = false;
        }
        if ctx.disable_inv {
            inv = false;
        }
        itheta = 0;
    } else {
        // Nothing was coded, so the decoder has to assume a pure mid.
        itheta = 0;
    }

    let qalloc = coder.tell_frac() as i32 - tell;
    *b -= qalloc;

    let (imid, iside, delta) = if itheta == 0 {
        *fill &= (1 << b_blocks) - 1;
        (32767, 0, -16384)
    } else if itheta == 16384 {
        *fill &= ((1 << b_blocks) - 1) << b_blocks;
        (0, 32767, 16384)
    } else {
        let imid = i32::from(bitexact_cos(itheta as i16));
        let iside = i32::from(bitexact_cos((16384 - itheta) as i16));
        // The mid/side allocation split minimizing squared error.
        let delta = i32::from(frac_mul16(
            ((n - 1) << 7) as i16,
            bitexact_log2tan(iside, imid) as i16,
        ));
        (imid, iside, delta)
    };

    Ok(SplitParams {
        inv,
        imid,
        iside,
        delta,
        itheta,
        qalloc,
    })
}

/// Codes the sign of a single sample band per channel.
fn quant_band_n1(
    ctx: &mut BandCtx,
    coder: &mut Coder,
    x: &mut [f32],
    y: Option<&mut [f32]>,
    lowband_out: Option<(&mut [f32], usize)>,
) -> Result<u32, EncoderError> {
    fn code_sign(
        ctx: &mut BandCtx,
        coder: &mut Coder,
        target: &mut [f32],
    ) -> Result<(), EncoderError> {
        let mut sign = 0_u32;
        if ctx.remaining_bits >= 1 << BITRES {
            if coder.is_encoder() {
                sign = u32::from(target[0] < 0.0);
            }
            coder.raw_bits(&mut sign, 1)?;
            ctx.remaining_bits -= 1 << BITRES;
        }
        target[0] = if sign != 0 { -1.0 } else { 1.0 };
        Ok(())
    }

    code_sign(ctx, coder, x)?;
    if let Some(y) = y {
        code_sign(ctx, coder, y)?;
    }

    if let Some((norm, offset)) = lowband_out {
        norm[offset] = x[0];
    }

    Ok(1)
}

/// Recursively splits and quantizes one partition of a band.
#[allow(clippy::too_many_arguments)]
fn quant_partition(
    ctx: &mut BandCtx,
    coder: &mut Coder,
    x: &mut [f32],
    mut b: i32,
    mut b_blocks: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    gain: f32,
    mut fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    let mode = ctx.mode;
    let cache = &mode.cache;
    let mut cm;

    // If we need 1.5 more bits than the largest codeword, split in two.
    let split_threshold = cache.pulses2bits(n, cache.max_pulses(n)) + 12;
    if lm != -1 && b > split_threshold && n > 2 {
        let half = n / 2;
        let b0 = b_blocks;
        let lm = lm - 1;
        if b_blocks == 1 {
            fill = (fill & 1) | (fill << 1);
        }
        b_blocks = (b_blocks + 1) >> 1;

        let (x_half, y_half) = x.split_at_mut(half);
        let params = compute_theta(
            ctx, coder, x_half, y_half, &mut b, b_blocks, b0, lm, false, &mut fill,
        )?;
        let mid = params.imid as f32 / 32768.0;
        let side = params.iside as f32 / 32768.0;
        let mut delta = params.delta;
        let itheta = params.itheta;

        // Give more bits to low-energy MDCTs than they would otherwise
        // deserve.
        if b0 > 1 && (itheta & 0x3fff) != 0 {
            if itheta > 8192 {
                // Rough approximation of pre-echo masking.
                delta -= delta >> (4 - lm);
            } else {
                // A forward masking slope of about 1.5 dB per 10 ms.
                delta = i32::min(0, delta + ((half as i32) << BITRES >> (5 - lm)));
            }
        }

        let mbits = i32::max(0, i32::min(b, (b - delta) / 2));
        let sbits = b - mbits;
        ctx.remaining_bits -= params.qalloc;

        let (lowband_mid, lowband_side) = match lowband {
            Some(lb) => (Some(&lb[..half]), Some(&lb[half..])),
            None => (None, None),
        };

        let rebalance = ctx.remaining_bits;
        if mbits >= sbits {
            cm = quant_partition(
                ctx, coder, x_half, mbits, b_blocks, lowband_mid, lm, gain * mid, fill,
            )?;
            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            let mut sbits = sbits;
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(
                ctx,
                coder,
                y_half,
                sbits,
                b_blocks,
                lowband_side,
                lm,
                gain * side,
                fill >> b_blocks,
            )? << (b0 >> 1);
        } else {
            cm = quant_partition(
                ctx,
                coder,
                y_half,
                sbits,
                b_blocks,
                lowband_side,
                lm,
                gain * side,
                fill >> b_blocks,
            )? << (b0 >> 1);
            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            let mut mbits = mbits;
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(
                ctx, coder, x_half, mbits, b_blocks, lowband_mid, lm, gain * mid, fill,
            )?;
        }
    } else {
        // The basic no-split case.
        let mut q = cache.bits2pulses(n, b);
        let mut curr_bits = cache.pulses2bits(n, q);
        ctx.remaining_bits -= curr_bits;

        // Ensures we can never bust the budget.
        while ctx.remaining_bits < 0 && q > 0 {
            ctx.remaining_bits += curr_bits;
            q -= 1;
            curr_bits = cache.pulses2bits(n, q);
            ctx.remaining_bits -= curr_bits;
        }

        if q != 0 {
            cm = match coder {
                Coder::Enc(enc) => alg_quant(x, q, ctx.spread, b_blocks, enc, &mode.cwrs, gain)?,
                Coder::Dec(dec) => alg_unquant(x, q, ctx.spread, b_blocks, dec, &mode.cwrs, gain)
                    .map_err(|_| EncoderError::InternalError("codeword decode failed"))?,
            };
        } else {
            // If there is no pulse, fill the band anyway.
            if fill != 0 {
                match lowband {
                    None => {
                        // Noise.
                        x.iter_mut().for_each(|v| {
                            ctx.seed = lcg_rand(ctx.seed);
                            *v = (ctx.seed as i32 >> 20) as f32;
                        });
                        cm = (1 << b_blocks) - 1;
                    }
                    Some(lb) => {
                        // Folded spectrum, with noise about 48 dB below the
                        // folding level.
                        x.iter_mut().zip(lb.iter()).for_each(|(v, &l)| {
                            ctx.seed = lcg_rand(ctx.seed);
                            let tmp = if ctx.seed & 0x8000 != 0 {
                                1.0 / 256.0
                            } else {
                                -1.0 / 256.0
                            };
                            *v = l + tmp;
                        });
                        cm = fill;
                    }
                }
                renormalise_vector(x, gain);
            } else {
                x.iter_mut().for_each(|v| *v = 0.0);
                cm = 0;
            }
        }
    }

    Ok(cm)
}

/// Quantizes one band of one channel, handling the time-frequency
/// recombination around the recursive partition.
#[allow(clippy::too_many_arguments)]
fn quant_band(
    ctx: &mut BandCtx,
    coder: &mut Coder,
    x: &mut [f32],
    b: i32,
    blocks: usize,
    norm: &mut [f32],
    lowband_offset: Option<usize>,
    lm: usize,
    lowband_out_offset: Option<usize>,
    gain: f32,
    mut fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    let n0 = n;
    let b0 = blocks;
    let long_blocks = b0 == 1;
    let tf_change = ctx.tf_change;
    let mut blocks = blocks;
    let mut n_b = n / blocks;
    let mut time_divide = 0;
    let mut recombine = 0;

    if n == 1 {
        return quant_band_n1(ctx, coder, x, None, lowband_out_offset.map(|off| (&mut *norm, off)));
    }

    // Copy the folding source out of the norm buffer; the Haar steps below
    // transform it in place.
    let mut lowband_scratch = [0.0_f32; MAX_PVQ_SIZE];
    let has_lowband = lowband_offset.is_some();
    if let Some(off) = lowband_offset {
        lowband_scratch[..n].copy_from_slice(&norm[off..off + n]);
    }
    let lowband = &mut lowband_scratch[..n];

    if tf_change > 0 {
        recombine = tf_change as usize;
    }

    for k in 0..recombine {
        if coder.is_encoder() {
            haar1(x, n >> k, 1 << k);
        }
        if has_lowband {
            haar1(lowband, n >> k, 1 << k);
        }
        fill = BIT_INTERLEAVE_TABLE[(fill & 0xF) as usize]
            | BIT_INTERLEAVE_TABLE[((fill >> 4) & 0xF) as usize] << 2;
    }
    blocks >>= recombine;
    n_b <<= recombine;

    // Increasing the time resolution.
    while (n_b & 1) == 0 && tf_change < 0 && time_divide < (-tf_change) as usize {
        if coder.is_encoder() {
            haar1(x, n_b, blocks);
        }
        if has_lowband {
            haar1(lowband, n_b, blocks);
        }
        fill |= fill << blocks;
        blocks <<= 1;
        n_b >>= 1;
        time_divide += 1;
    }
    let b0_inner = blocks;
    let n_b0 = n_b;

    // Reorganize the samples in time order instead of frequency order.
    if b0_inner > 1 {
        if coder.is_encoder() {
            deinterleave_hadamard(x, n_b >> recombine, b0_inner << recombine, long_blocks);
        }
        if has_lowband {
            deinterleave_hadamard(lowband, n_b >> recombine, b0_inner << recombine, long_blocks);
        }
    }

    let mut cm = quant_partition(
        ctx,
        coder,
        x,
        b,
        blocks,
        if has_lowband { Some(&*lowband) } else { None },
        lm as i32,
        gain,
        fill,
    )?;

    // Re-organize the samples in frequency order.
    if b0_inner > 1 {
        interleave_hadamard(x, n_b >> recombine, b0_inner << recombine, long_blocks);
    }

    // Undo the time-resolution increase.
    let mut blocks = b0_inner;
    let mut n_b = n_b0;
    for _ in 0..time_divide {
        blocks >>= 1;
        n_b <<= 1;
        cm |= cm >> blocks;
        haar1(x, n_b, blocks);
    }

    // Undo the band recombining.
    for k in 0..recombine {
        cm = BIT_DEINTERLEAVE_TABLE[(cm & 0xF) as usize];
        haar1(x, n0 >> k, 1 << k);
    }
    let blocks = blocks << recombine;

    // Scale the output for later folding.
    if let Some(off) = lowband_out_offset {
        let g = (n0 as f32).sqrt();
        norm[off..off + n0]
            .iter_mut()
            .zip(x.iter())
            .for_each(|(o, &v)| *o = g * v);
    }

    Ok(cm & ((1 << blocks) - 1))
}

/// Stereo wrapper around [`quant_band`].
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    ctx: &mut BandCtx,
    coder: &mut Coder,
    x: &mut [f32],
    y: &mut [f32],
    b: i32,
    blocks: usize,
    norm: &mut [f32],
    lowband_offset: Option<usize>,
    lm: usize,
    lowband_out_offset: Option<usize>,
    fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    if n == 1 {
        return quant_band_n1(
            ctx,
            coder,
            x,
            Some(y),
            lowband_out_offset.map(|off| (&mut *norm, off)),
        );
    }

    let orig_fill = fill;
    let mut fill = fill;
    let mut b = b;

    let params = compute_theta(
        ctx, coder, x, y, &mut b, blocks, blocks, lm as i32, true, &mut fill,
    )?;
    let inv = params.inv;
    let mid = params.imid as f32 / 32768.0;
    let side = params.iside as f32 / 32768.0;
    let itheta = params.itheta;
    let cm;

    if n == 2 {
        // Two-sample stereo needs only a sign for the side.
        let mut sbits = 0;
        if itheta != 0 && itheta != 16384 {
            sbits = 1 << BITRES;
        }
        let mbits = b - sbits;
        ctx.remaining_bits -= params.qalloc + sbits;

        let swapped = itheta > 8192;
        let mut sign = 0_u32;
        if sbits != 0 {
            if coder.is_encoder() {
                let (x2, y2): (&[f32], &[f32]) = if swapped { (&*y, &*x) } else { (&*x, &*y) };
                sign = u32::from(x2[0] * y2[1] - x2[1] * y2[0] < 0.0);
            }
            coder.raw_bits(&mut sign, 1)?;
        }
        let sign = 1.0 - 2.0 * sign as f32;

        {
            let x2: &mut [f32] = if swapped { &mut *y } else { &mut *x };
            cm = quant_band(
                ctx,
                coder,
                x2,
                mbits,
                blocks,
                norm,
                lowband_offset,
                lm,
                lowband_out_offset,
                1.0,
                orig_fill,
            )?;
        }
        {
            let (x2, y2): (&mut [f32], &mut [f32]) = if swapped {
                (&mut *y, &mut *x)
            } else {
                (&mut *x, &mut *y)
            };
            y2[0] = -sign * x2[1];
            y2[1] = sign * x2[0];
        }

        // Reconstruct the channel pair.
        x[0] *= mid;
        x[1] *= mid;
        y[0] *= side;
        y[1] *= side;
        let tmp = x[0];
        x[0] = tmp - y[0];
        y[0] = tmp + y[0];
        let tmp = x[1];
        x[1] = tmp - y[1];
        y[1] = tmp + y[1];
    } else {
        // Normal split.
        let mbits = i32::max(0, i32::min(b, (b - params.delta) / 2));
        let sbits = b - mbits;
        ctx.remaining_bits -= params.qalloc;

        let rebalance = ctx.remaining_bits;
        if mbits >= sbits {
            // The mid keeps unit gain so later bands can fold from it.
            cm = quant_band(
                ctx,
                coder,
                x,
                mbits,
                blocks,
                norm,
                lowband_offset,
                lm,
                lowband_out_offset,
                1.0,
                fill,
            )?;
            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            let mut sbits = sbits;
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            // A stereo split never folds the side.
            let side_cm = quant_band(
                ctx,
                coder,
                y,
                sbits,
                blocks,
                norm,
                None,
                lm,
                None,
                side,
                fill >> blocks,
            )?;
            let cm = cm | side_cm;
            stereo_finish(x, y, mid, inv);
            return Ok(cm);
        } else {
            let side_cm = quant_band(
                ctx,
                coder,
                y,
                sbits,
                blocks,
                norm,
                None,
                lm,
                None,
                side,
                fill >> blocks,
            )?;
            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            let mut mbits = mbits;
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            let mid_cm = quant_band(
                ctx,
                coder,
                x,
                mbits,
                blocks,
                norm,
                lowband_offset,
                lm,
                lowband_out_offset,
                1.0,
                fill,
            )?;
            let cm = side_cm | mid_cm;
            stereo_finish(x, y, mid, inv);
            return Ok(cm);
        }
    }

    if inv {
        y.iter_mut().for_each(|v| *v = -*v);
    }
    Ok(cm)
}

fn stereo_finish(x: &mut [f32], y: &mut [f32], mid: f32, inv: bool) {
    stereo_merge(x, y, mid);
    if inv {
        y.iter_mut().for_each(|v| *v = -*v);
    }
}

/// Duplicates enough of the first coded band to fold the second one when
/// decoding starts above band zero (hybrid frames).
fn special_hybrid_folding(
    norm: &mut [f32],
    norm_second: Option<&mut [f32]>,
    start: usize,
    m: usize,
) {
    let n1 = m * (EBANDS[start + 1] - EBANDS[start]);
    let n2 = m * (EBANDS[start + 2] - EBANDS[start + 1]);
    if n2 <= n1 || 2 * n1 < n2 {
        return;
    }
    norm.copy_within(2 * n1 - n2..n1, n1);
    if let Some(norm2) = norm_second {
        norm2.copy_within(2 * n1 - n2..n1, n1);
    }
}

/// Quantizes or decodes all band shapes of the frame.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_all_bands(
    coder: &mut Coder,
    mode: &CeltMode,
    start: usize,
    end: usize,
    x_full: &mut [f32],
    y_full: Option<&mut [f32]>,
    collapse_masks: &mut [u8; 2 * MAX_BANDS],
    band_amps: &[[f32; MAX_BANDS]; 2],
    pulses: &[i32; MAX_BANDS],
    short_blocks: bool,
    spread: Spread,
    dual_stereo: bool,
    intensity: usize,
    tf_res: &[i8; MAX_BANDS],
    total_bits: i32,
    mut balance: i32,
    lm: usize,
    coded_bands: usize,
    seed: &mut u32,
    disable_inv: bool,
    norm_scratch: &mut [f32],
) -> Result<(), EncoderError> {
    let m = 1 << lm;
    let b_blocks = if short_blocks { m } else { 1 };
    let channels = 1 + usize::from(y_full.is_some());
    let norm_offset = m * EBANDS[start];
    let norm_len = m * EBANDS[MAX_BANDS - 1] - norm_offset;
    debug_assert!(norm_scratch.len() >= 2 * norm_len);

    let mut ctx = BandCtx {
        mode,
        band: start,
        intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        seed: *seed,
        disable_inv,
        band_amps: *band_amps,
    };

    let (norm_first, norm_second) = norm_scratch.split_at_mut(norm_len);
    let mut dual_stereo = dual_stereo;
    let mut lowband_offset = 0_usize;
    let mut update_lowband = true;
    let mut y_full = y_full;

    for band in start..end {
        ctx.band = band;
        let last = band == end - 1;
        let band_lo = m * EBANDS[band];
        let band_hi = m * EBANDS[band + 1];
        let n = band_hi - band_lo;
        let tell = coder.tell_frac() as i32;

        // Compute how many bits we want to allocate to this band.
        if band != start {
            balance -= tell;
        }
        let remaining_bits = total_bits - tell - 1;
        ctx.remaining_bits = remaining_bits;

        let b = if band < coded_bands {
            let curr_balance = balance / i32::min(3, (coded_bands - band) as i32);
            i32::max(
                0,
                i32::min(
                    16383,
                    i32::min(remaining_bits + 1, pulses[band] + curr_balance),
                ),
            )
        } else {
            0
        };

        if (band_lo as i32 - n as i32 >= (m * EBANDS[start]) as i32 || band == start + 1)
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = band;
        }
        if band == start + 1 {
            special_hybrid_folding(
                norm_first,
                if channels == 2 {
                    Some(norm_second)
                } else {
                    None
                },
                start,
                m,
            );
        }

        ctx.tf_change = tf_res[band];

        // A conservative estimate of the collapse masks of the bands the
        // fold reads from.
        let (mut x_cm, mut y_cm);
        let mut effective_lowband = None;
        if lowband_offset != 0
            && (spread != Spread::Aggressive || b_blocks > 1 || ctx.tf_change < 0)
        {
            // This ensures we never repeat spectral content within one band.
            let eff =
                i32::max(0, (m * EBANDS[lowband_offset]) as i32 - norm_offset as i32 - n as i32)
                    as usize;
            effective_lowband = Some(eff);
            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if fold_start == 0 || m * EBANDS[fold_start] <= eff + norm_offset {
                    break;
                }
            }
            let mut fold_end = lowband_offset;
            while fold_end < band && m * EBANDS[fold_end] < eff + norm_offset + n {
                fold_end += 1;
            }
            x_cm = 0;
            y_cm = 0;
            (fold_start..usize::max(fold_end, fold_start + 1)).for_each(|fold_i| {
                x_cm |= u32::from(collapse_masks[fold_i * channels]);
                y_cm |= u32::from(collapse_masks[fold_i * channels + channels - 1]);
            });
        } else {
            // The LCG fold leaves (almost) no block silent.
            x_cm = (1 << b_blocks) - 1;
            y_cm = x_cm;
        }

        if dual_stereo && band == intensity {
            // Switch off dual stereo to do intensity.
            dual_stereo = false;
            (0..band_lo - norm_offset).for_each(|j| {
                norm_first[j] = 0.5 * (norm_first[j] + norm_second[j]);
            });
        }

        let lowband_out = if last {
            None
        } else {
            Some(band_lo - norm_offset)
        };

        if dual_stereo {
            let y = y_full.as_deref_mut().map(|buf| &mut buf[band_lo..band_hi]);
            let x = &mut x_full[band_lo..band_hi];
            x_cm = quant_band(
                &mut ctx,
                coder,
                x,
                b / 2,
                b_blocks,
                norm_first,
                effective_lowband,
                lm,
                lowband_out,
                1.0,
                x_cm,
            )?;
            if let Some(y) = y {
                y_cm = quant_band(
                    &mut ctx,
                    coder,
                    y,
                    b / 2,
                    b_blocks,
                    norm_second,
                    effective_lowband,
                    lm,
                    lowband_out,
                    1.0,
                    y_cm,
                )?;
            }
        } else if let Some(y_buf) = y_full.as_deref_mut() {
            let x = &mut x_full[band_lo..band_hi];
            let y = &mut y_buf[band_lo..band_hi];
            x_cm = quant_band_stereo(
                &mut ctx,
                coder,
                x,
                y,
                b,
                b_blocks,
                norm_first,
                effective_lowband,
                lm,
                lowband_out,
                x_cm | y_cm,
            )?;
            y_cm = x_cm;
        } else {
            let x = &mut x_full[band_lo..band_hi];
            x_cm = quant_band(
                &mut ctx,
                coder,
                x,
                b,
                b_blocks,
                norm_first,
                effective_lowband,
                lm,
                lowband_out,
                1.0,
                x_cm | y_cm,
            )?;
            y_cm = x_cm;
        }

        collapse_masks[band * channels] = x_cm as u8;
        collapse_masks[band * channels + channels - 1] = y_cm as u8;
        balance += pulses[band] + tell;

        // Keep updating the folding position only while the band has at
        // least one bit per sample.
        update_lowband = b > (n as i32) << BITRES;
    }

    *seed = ctx.seed;
    Ok(())
}

/// Injects pseudo-random energy into short-block partitions that decoded to
/// silence, scaled from the lower of the two previous frames' energies.
#[allow(clippy::too_many_arguments)]
pub(crate) fn anti_collapse(
    x: &mut [f32],
    channels: usize,
    channel_stride: usize,
    collapse_masks: &[u8; 2 * MAX_BANDS],
    lm: usize,
    start: usize,
    end: usize,
    log_e: &[[f32; MAX_BANDS]; 2],
    prev1_log_e: &[[f32; MAX_BANDS]; 2],
    prev2_log_e: &[[f32; MAX_BANDS]; 2],
    pulses: &[i32; MAX_BANDS],
    mut seed: u32,
    mono_decode: bool,
) {
    for band in start..end {
        let n0 = EBANDS[band + 1] - EBANDS[band];
        let depth = ((1 + pulses[band]) / n0 as i32) >> lm;
        let thresh = 0.5 * crate::math::fast_exp2(-0.125 * depth as f32);
        let sqrt_1 = 1.0 / ((n0 << lm) as f32).sqrt();

        for c in 0..channels {
            let mut prev1 = prev1_log_e[c][band];
            let mut prev2 = prev2_log_e[c][band];
            if mono_decode {
                // Stereo history collapsed into the safer of the two.
                prev1 = f32::max(prev1, prev1_log_e[1][band]);
                prev2 = f32::max(prev2, prev2_log_e[1][band]);
            }
            let e_diff = f32::max(0.0, log_e[c][band] - f32::min(prev1, prev2));

            let mut r = 2.0 * crate::math::fast_exp2(-e_diff);
            if lm == 3 {
                r *= std::f32::consts::SQRT_2;
            }
            r = f32::min(thresh, r) * sqrt_1;

            let base = c * channel_stride + (EBANDS[band] << lm);
            let mut renormalize = false;
            (0..1 << lm).for_each(|k| {
                // Detect collapse.
                if collapse_masks[band * channels + c] & (1 << k) == 0 {
                    // Fill with noise.
                    (0..n0).for_each(|j| {
                        seed = lcg_rand(seed);
                        x[base + (j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    });
                    renormalize = true;
                }
            });
            if renormalize {
                renormalise_vector(&mut x[base..base + (n0 << lm)], 1.0);
            }
        }
    }
}
