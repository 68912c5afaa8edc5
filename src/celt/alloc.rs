//! Implements the bit allocator.
//!
//! Given the bit budget that remains after the header decisions, the
//! allocator distributes shape bits (in eighth-bit resolution) and fine
//! energy bits over the coded bands. Both sides of the codec run the same
//! routine from the same inputs; the only coded symbols are the band skip
//! flags, the intensity stereo band and the dual stereo flag, which pass
//! through the [`Coder`] so the decision points line up exactly.

use crate::celt::mode::{
    EBANDS, LOG2_FRAC, LOG_N, MAX_BANDS, MAX_FINE_BITS, STATIC_ALLOC, STATIC_CAPS, ALLOC_VECTORS,
};
use crate::celt::Coder;
use crate::encoder_error::EncoderError;
use crate::range_coder::BITRES;

/// Offset (in whole bits, scaled by the band denominator) subtracted from a
/// band's fair share before fine energy bits are split off.
const FINE_OFFSET: i32 = 21;
/// The interpolation depth between two allocation matrix rows.
const ALLOC_STEPS: usize = 6;

/// The allocator's outputs.
pub(crate) struct Allocation {
    /// Shape bits per band in eighth bits.
    pub(crate) pulses: [i32; MAX_BANDS],
    /// Fine energy bits per band.
    pub(crate) fine_quant: [i32; MAX_BANDS],
    /// Whether the band is an early candidate for the energy finalizer.
    pub(crate) fine_priority: [bool; MAX_BANDS],
    /// Bands actually coded; the tail above this folds.
    pub(crate) coded_bands: usize,
    /// Leftover eighth bits handed to the band quantizer.
    pub(crate) balance: i32,
    /// First band coded as intensity stereo.
    pub(crate) intensity: usize,
    /// Whether the channels are coded separately.
    pub(crate) dual_stereo: bool,
}

/// Encoder-side hints for the symbols the allocator codes.
#[derive(Clone, Copy)]
pub(crate) struct AllocHints {
    /// The intensity stereo band the encoder chose.
    pub(crate) intensity: usize,
    /// The dual stereo decision the encoder chose.
    pub(crate) dual_stereo: bool,
    /// Coded band count of the previous frame, for skip hysteresis.
    pub(crate) prev_coded_bands: usize,
    /// The highest band worth keeping, from the encoder's signal analysis.
    pub(crate) signal_bandwidth: usize,
}

impl Default for AllocHints {
    fn default() -> Self {
        Self {
            intensity: 0,
            dual_stereo: false,
            prev_coded_bands: MAX_BANDS,
            signal_bandwidth: MAX_BANDS - 1,
        }
    }
}

/// Fills the per-band allocation caps in eighth bits.
pub(crate) fn init_caps(caps: &mut [i32; MAX_BANDS], lm: usize, channels: usize) {
    (0..MAX_BANDS).for_each(|j| {
        let n = (EBANDS[j + 1] - EBANDS[j]) as i32;
        let seed = i32::from(STATIC_CAPS[lm][channels - 1][j]);
        caps[j] = ((seed + 64) * n * channels as i32) << lm >> 2;
    });
}

/// A candidate allocation for one matrix row interpolation point.
#[allow(clippy::too_many_arguments)]
fn psum_for(
    start: usize,
    end: usize,
    bits1: &[i32; MAX_BANDS],
    bits2: &[i32; MAX_BANDS],
    interp: i32,
    thresh: &[i32; MAX_BANDS],
    caps: &[i32; MAX_BANDS],
    alloc_floor: i32,
) -> i32 {
    let mut done = false;
    let mut psum = 0;
    (start..end).rev().for_each(|j| {
        let tmp = bits1[j] + ((interp * bits2[j]) >> ALLOC_STEPS);
        if tmp >= thresh[j] || done {
            done = true;
            psum += i32::min(tmp, caps[j]);
        } else if tmp >= alloc_floor {
            psum += alloc_floor;
        }
    });
    psum
}

/// Computes the final allocation and codes the skip, intensity and dual
/// stereo symbols.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::needless_range_loop)]
pub(crate) fn compute_allocation(
    coder: &mut Coder,
    start: usize,
    end: usize,
    lm: usize,
    channels: usize,
    offsets: &[i32; MAX_BANDS],
    caps: &[i32; MAX_BANDS],
    trim: i32,
    total: i32,
    hints: AllocHints,
) -> Result<Allocation, EncoderError> {
    let c = channels as i32;
    let log_m = (lm as i32) << BITRES;
    let alloc_floor = c << BITRES;
    let mut total = i32::max(total, 0);

    let mut thresh = [0_i32; MAX_BANDS];
    let mut trim_offset = [0_i32; MAX_BANDS];
    let mut bits1 = [0_i32; MAX_BANDS];
    let mut bits2 = [0_i32; MAX_BANDS];
    let mut bits = [0_i32; MAX_BANDS];
    let mut fine_quant = [0_i32; MAX_BANDS];
    let mut fine_priority = [false; MAX_BANDS];

    let mut skip_start = start;

    // Reserve a bit to signal the end of skipped bands.
    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;

    // Reserve the intensity and dual stereo parameters.
    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if channels == 2 {
        intensity_rsv = LOG2_FRAC[end - start] as i32;
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            if total >= 1 << BITRES {
                dual_stereo_rsv = 1 << BITRES;
                total -= dual_stereo_rsv;
            }
        }
    }

    (start..end).for_each(|j| {
        let n0 = (EBANDS[j + 1] - EBANDS[j]) as i32;
        // Below this threshold a band is not worth coding at all.
        thresh[j] = i32::max(c << BITRES, (3 * n0) << lm << BITRES >> 4);
        // Tilt of the allocation curve; trim above the neutral 5 shifts
        // bits down into the low bands, below 5 up into the high bands.
        trim_offset[j] = c * n0 * (trim - 5 - lm as i32) * (end - j - 1) as i32
            * (1 << (lm as u32 + BITRES))
            >> 6;
        if (n0 << lm) == 1 {
            trim_offset[j] -= c << BITRES;
        }
    });

    // Coarse search over the allocation matrix rows.
    let mut lo = 1_usize;
    let mut hi = ALLOC_VECTORS - 1;
    loop {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;
        for j in (start..end).rev() {
            let n0 = (EBANDS[j + 1] - EBANDS[j]) as i32;
            let mut bitsj = (c * n0 * i32::from(STATIC_ALLOC[mid][j])) << lm >> 2;
            if bitsj > 0 {
                bitsj = i32::max(0, bitsj + trim_offset[j]);
            }
            bitsj += offsets[j];
            if bitsj >= thresh[j] || done {
                done = true;
                psum += i32::min(bitsj, caps[j]);
            } else if bitsj >= alloc_floor {
                psum += alloc_floor;
            }
        }
        if psum > total {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
        if lo > hi {
            break;
        }
    }

    let hi_row = lo;
    let lo_row = lo - 1;

    (start..end).for_each(|j| {
        let n0 = (EBANDS[j + 1] - EBANDS[j]) as i32;
        let row_bits = |row: usize| -> i32 {
            let b = (c * n0 * i32::from(STATIC_ALLOC[row][j])) << lm >> 2;
            if b > 0 {
                i32::max(0, b + trim_offset[j])
            } else {
                b
            }
        };
        bits1[j] = row_bits(lo_row);
        bits2[j] = row_bits(usize::min(hi_row, ALLOC_VECTORS - 1));
        if offsets[j] > 0 {
            skip_start = j;
            if lo_row > 0 {
                bits1[j] += offsets[j];
            }
            bits2[j] += offsets[j];
        }
        bits2[j] = i32::max(0, bits2[j] - bits1[j]);
    });

    // Binary interpolation between the two rows.
    let mut ilo = 0_i32;
    let mut ihi = 1 << ALLOC_STEPS;
    (0..ALLOC_STEPS).for_each(|_| {
        let mid = (ilo + ihi) >> 1;
        let psum = psum_for(start, end, &bits1, &bits2, mid, &thresh, caps, alloc_floor);
        if psum > total {
            ihi = mid;
        } else {
            ilo = mid;
        }
    });

    let mut psum = 0;
    let mut done = false;
    for j in (start..end).rev() {
        let tmp = bits1[j] + ((ilo * bits2[j]) >> ALLOC_STEPS);
        if tmp >= thresh[j] || done {
            done = true;
            bits[j] = i32::min(tmp, caps[j]);
        } else if tmp >= alloc_floor {
            bits[j] = alloc_floor;
        } else {
            bits[j] = 0;
        }
        psum += bits[j];
    }

    // Decide how many bands to actually code, stealing the bits of skipped
    // bands back into the budget.
    let mut coded_bands = end;
    let mut intensity_rsv = intensity_rsv;
    let mut dual_stereo_rsv = dual_stereo_rsv;
    loop {
        let j = coded_bands - 1;
        if j <= skip_start {
            // Give the reserved skip bit back.
            total += skip_rsv;
            break;
        }

        // The leftover bits this band would pick up during the final
        // distribution, including what skipped bands above returned.
        let left = total - psum;
        let width_all = (EBANDS[coded_bands] - EBANDS[start]) as i32;
        let percoeff = left / width_all;
        let left = left - width_all * percoeff;
        let rem = i32::max(left - (EBANDS[j] - EBANDS[start]) as i32, 0);
        let band_width = (EBANDS[coded_bands] - EBANDS[j]) as i32;
        let mut band_bits = bits[j] + percoeff * band_width + rem;

        if band_bits >= i32::max(thresh[j], alloc_floor + (1 << BITRES)) {
            // The skip flag is only coded above the threshold; below it the
            // band is force-skipped so the flag itself always fits.
            let mut keep = true;
            if coder.is_encoder() {
                let depth_threshold = if coded_bands > 17 {
                    if j < hints.prev_coded_bands {
                        7
                    } else {
                        9
                    }
                } else {
                    0
                };
                keep = coded_bands <= start + 2
                    || (band_bits > (depth_threshold * band_width) << lm << BITRES >> 4
                        && j <= hints.signal_bandwidth);
            }
            coder.bit_logp(&mut keep, 1)?;
            if keep {
                break;
            }
            // We used a bit to skip this band.
            psum += 1 << BITRES;
            band_bits -= 1 << BITRES;
        }

        // Reclaim the bits originally allocated to this band.
        psum -= bits[j] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = LOG2_FRAC[j - start] as i32;
        }
        psum += intensity_rsv;

        if band_bits >= alloc_floor {
            // Keep a fine energy bit per channel.
            psum += alloc_floor;
            bits[j] = alloc_floor;
        } else {
            bits[j] = 0;
        }

        coded_bands -= 1;
        if coded_bands <= start {
            break;
        }
    }

    // Intensity and dual stereo parameters.
    let mut intensity = 0_usize;
    let mut dual_stereo = false;
    if intensity_rsv > 0 {
        let mut value = (hints.intensity.clamp(start, coded_bands) - start) as u32;
        coder.uniform(&mut value, (coded_bands + 1 - start) as u32)?;
        intensity = start + value as usize;
    }
    if intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }
    if dual_stereo_rsv > 0 {
        dual_stereo = hints.dual_stereo;
        coder.bit_logp(&mut dual_stereo, 1)?;
    }

    // Distribute the remaining bits proportionally to band width.
    let left = total - psum;
    let width_all = (EBANDS[coded_bands] - EBANDS[start]) as i32;
    let percoeff = left / width_all;
    let mut left = left - width_all * percoeff;
    (start..coded_bands).for_each(|j| {
        bits[j] += percoeff * (EBANDS[j + 1] - EBANDS[j]) as i32;
    });
    (start..coded_bands).for_each(|j| {
        let tmp = i32::min(left, (EBANDS[j + 1] - EBANDS[j]) as i32);
        bits[j] += tmp;
        left -= tmp;
    });

    // Split fine energy bits off every band's allocation.
    let mut balance = 0_i32;
    let stereo = (channels - 1) as u32;
    for j in start..coded_bands {
        let n0 = (EBANDS[j + 1] - EBANDS[j]) as i32;
        let n = n0 << lm;
        let bit = bits[j] + balance;
        let mut excess;

        if n > 1 {
            excess = i32::max(bit - caps[j], 0);
            bits[j] = bit - excess;

            // An extra degree of freedom for coupled stereo.
            let den = c * n
                + i32::from(channels == 2 && n > 2 && !dual_stereo && j < intensity);
            let nclog_n = den * (LOG_N[j] + log_m);
            let mut offset = (nclog_n >> 1) - den * FINE_OFFSET;
            if n == 2 {
                offset += den << BITRES >> 2;
            }
            // Make the second and third fine bits cheaper to allocate.
            if bits[j] + offset < (den * 2) << BITRES {
                offset += nclog_n >> 2;
            } else if bits[j] + offset < (den * 3) << BITRES {
                offset += nclog_n >> 3;
            }

            let ebits = i32::max(0, bits[j] + offset + (den << (BITRES - 1)));
            let mut ebits = (ebits / den) >> BITRES;
            if c * ebits > bits[j] >> BITRES {
                ebits = bits[j] >> stereo >> BITRES;
            }
            ebits = i32::min(ebits, MAX_FINE_BITS);
            fine_priority[j] = ebits * (den << BITRES) >= bits[j] + offset;
            bits[j] -= c * ebits << BITRES;
            fine_quant[j] = ebits;
        } else {
            // A one-bin band is a pure sign; everything else refines energy.
            excess = i32::max(bit - (c << BITRES), 0);
            bits[j] = bit - excess;
            fine_quant[j] = 0;
            fine_priority[j] = true;
        }

        // Fine energy cannot use the shape re-balancing, so re-balance here.
        if excess > 0 {
            let extra_fine = i32::min(excess >> (stereo + BITRES), MAX_FINE_BITS - fine_quant[j]);
            fine_quant[j] += extra_fine;
            let extra_bits = extra_fine * c << BITRES;
            fine_priority[j] = extra_bits >= excess - balance;
            excess -= extra_bits;
        }
        balance = excess;
    }

    // Skipped bands spend whatever they kept on fine energy.
    for j in coded_bands..end {
        fine_quant[j] = bits[j] >> stereo >> BITRES;
        fine_priority[j] = fine_quant[j] < 1;
        bits[j] = 0;
    }

    Ok(Allocation {
        pulses: bits,
        fine_quant,
        fine_priority,
        coded_bands,
        balance,
        intensity,
        dual_stereo,
    })
}
