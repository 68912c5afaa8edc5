//! Static mode data: band layout, probability models and the pulse cache.
//!
//! All tables in this module are normative. They describe the 48 kHz mode
//! with 21 critical bands that every frame size shares; per frame size the
//! band widths scale by `1 << LM`.

use crate::celt::cwrs::CwrsTable;

/// The number of critical bands.
pub(crate) const MAX_BANDS: usize = 21;
/// Pre-emphasis coefficient.
pub(crate) const PREEMPHASIS: f32 = 0.85;
/// Internal signal scale.
pub(crate) const SIG_SCALE: f32 = 32768.0;
/// Samples of a short block, and the lapped overlap length.
pub(crate) const SHORT_BLOCK_SIZE: usize = 120;
/// The overlap of the lapped transform.
pub(crate) const OVERLAP: usize = 120;
/// The largest supported frame size in samples.
pub(crate) const MAX_FRAME_SIZE: usize = 960;
/// The largest pulse count a single codeword can carry.
pub(crate) const MAX_PULSES: usize = 128;
/// The number of rows in the allocation matrix.
pub(crate) const ALLOC_VECTORS: usize = 11;
/// The highest fine energy depth per band.
pub(crate) const MAX_FINE_BITS: i32 = 8;

/// Band boundaries in MDCT bins at LM 0. Band `b` covers
/// `[EBANDS[b] << LM, EBANDS[b + 1] << LM)`.
pub(crate) const EBANDS: [usize; MAX_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// log2 of the band widths at LM 0, in eighth bits.
pub(crate) const LOG_N: [i32; MAX_BANDS] = [
    0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 16, 16, 16, 21, 21, 24, 29, 34, 36,
];

/// Inter-frame prediction coefficient per LM.
pub(crate) const PRED_ALPHA: [f32; 4] = [
    29440.0 / 32768.0,
    26112.0 / 32768.0,
    21248.0 / 32768.0,
    16384.0 / 32768.0,
];

/// Inter-band accumulator coefficient per LM. These are the `1 - beta`
/// factors applied to each quantized delta.
pub(crate) const PRED_BETA: [f32; 4] = [
    1.0 - 30147.0 / 32768.0,
    1.0 - 22282.0 / 32768.0,
    1.0 - 12124.0 / 32768.0,
    1.0 - 6554.0 / 32768.0,
];

/// The accumulator coefficient of intra frames (prediction disabled).
pub(crate) const PRED_BETA_INTRA: f32 = 1.0 - 4915.0 / 32768.0;

/// Coarse energy probability model for intra frames, per LM. Entry `2b` is
/// the zero-delta frequency seed of band `b` and entry `2b + 1` the Laplace
/// decay seed.
#[rustfmt::skip]
pub(crate) const E_PROB_MODEL_INTRA: [[u8; 42]; 4] = [
    // 120-samples
    [
        24, 179, 48, 138, 54, 135, 54, 132, 53, 134, 56, 133, 55, 132, 55, 132, 61, 114, 70, 96,
        74, 88, 75, 88, 87, 74, 89, 66, 91, 67, 100, 59, 108, 50, 120, 40, 122, 37, 97, 43, 78, 50,
    ],
    // 240-samples
    [
        23, 178, 54, 115, 63, 102, 66, 98, 69, 99, 74, 89, 71, 91, 73, 91, 78, 89, 86, 80, 92, 66,
        93, 64, 102, 59, 103, 60, 104, 60, 117, 52, 123, 44, 138, 35, 133, 31, 97, 38, 77, 45,
    ],
    // 480-samples
    [
        21, 178, 59, 110, 71, 86, 75, 85, 84, 83, 91, 66, 88, 73, 87, 72, 92, 75, 98, 72, 105, 58,
        107, 54, 115, 52, 114, 55, 112, 56, 129, 51, 132, 40, 150, 33, 140, 29, 98, 35, 77, 42,
    ],
    // 960-samples
    [
        22, 178, 63, 114, 74, 82, 84, 83, 92, 82, 103, 62, 96, 72, 96, 67, 101, 73, 107, 72, 113,
        55, 118, 52, 125, 52, 118, 52, 117, 55, 135, 49, 137, 39, 157, 32, 145, 29, 97, 33, 77, 40,
    ],
];

/// Coarse energy probability model for inter frames, per LM.
#[rustfmt::skip]
pub(crate) const E_PROB_MODEL_INTER: [[u8; 42]; 4] = [
    // 120-samples
    [
        72, 127, 65, 129, 66, 128, 65, 128, 64, 128, 62, 128, 64, 128, 64, 128, 92, 78, 92, 79, 92,
        78, 90, 79, 116, 41, 115, 40, 114, 40, 132, 26, 132, 26, 145, 17, 161, 12, 176, 10, 177,
        11,
    ],
    // 240-samples
    [
        83, 78, 84, 81, 88, 75, 86, 74, 87, 71, 90, 73, 93, 74, 93, 74, 109, 40, 114, 36, 117, 34,
        117, 34, 143, 17, 145, 18, 146, 19, 162, 12, 165, 10, 178, 7, 189, 6, 190, 8, 177, 9,
    ],
    // 480-samples
    [
        61, 90, 93, 60, 105, 42, 107, 41, 110, 45, 116, 38, 113, 38, 112, 38, 124, 26, 132, 27,
        136, 19, 140, 20, 155, 14, 159, 16, 158, 18, 170, 13, 177, 10, 187, 8, 192, 6, 175, 9, 159,
        10,
    ],
    // 960-samples
    [
        42, 121, 96, 66, 108, 43, 111, 40, 117, 44, 123, 32, 120, 36, 119, 33, 127, 33, 134, 34,
        139, 21, 147, 23, 152, 20, 158, 25, 154, 26, 166, 21, 173, 16, 184, 13, 184, 10, 150, 13,
        139, 15,
    ],
];

/// Maximum allocation per band, the `(value + 64) * N * C << LM >> 2` seed
/// values, per LM and channel count.
#[rustfmt::skip]
pub(crate) const STATIC_CAPS: [[[u8; MAX_BANDS]; 2]; 4] = [
    // 120-sample
    [
        [224, 224, 224, 224, 224, 224, 224, 224, 160, 160,
         160, 160, 185, 185, 185, 178, 178, 168, 134,  61,  37],
        [224, 224, 224, 224, 224, 224, 224, 224, 240, 240,
         240, 240, 207, 207, 207, 198, 198, 183, 144,  66,  40],
    ],
    // 240-sample
    [
        [160, 160, 160, 160, 160, 160, 160, 160, 185, 185,
         185, 185, 193, 193, 193, 183, 183, 172, 138,  64,  38],
        [240, 240, 240, 240, 240, 240, 240, 240, 207, 207,
         207, 207, 204, 204, 204, 193, 193, 180, 143,  66,  40],
    ],
    // 480-sample
    [
        [185, 185, 185, 185, 185, 185, 185, 185, 193, 193,
         193, 193, 193, 193, 193, 183, 183, 172, 138,  65,  39],
        [207, 207, 207, 207, 207, 207, 207, 207, 204, 204,
         204, 204, 201, 201, 201, 188, 188, 176, 141,  66,  40],
    ],
    // 960-sample
    [
        [193, 193, 193, 193, 193, 193, 193, 193, 193, 193,
         193, 193, 194, 194, 194, 184, 184, 173, 139,  65,  39],
        [204, 204, 204, 204, 204, 204, 204, 204, 201, 201,
         201, 201, 198, 198, 198, 187, 187, 175, 140,  66,  40],
    ],
];

/// The allocation matrix in 1/32 bit per sample, from the lowest quality row
/// to the highest.
#[rustfmt::skip]
pub(crate) const STATIC_ALLOC: [[u8; MAX_BANDS]; ALLOC_VECTORS] = [
    [   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0 ],
    [  90,  80,  75,  69,  63,  56,  49,  40,  34,  29,  20,  18,  10,   0,   0,   0,   0,   0,   0,   0,   0 ],
    [ 110, 100,  90,  84,  78,  71,  65,  58,  51,  45,  39,  32,  26,  20,  12,   0,   0,   0,   0,   0,   0 ],
    [ 118, 110, 103,  93,  86,  80,  75,  70,  65,  59,  53,  47,  40,  31,  23,  15,   4,   0,   0,   0,   0 ],
    [ 126, 119, 112, 104,  95,  89,  83,  78,  72,  66,  60,  54,  47,  39,  32,  25,  17,  12,   1,   0,   0 ],
    [ 134, 127, 120, 114, 103,  97,  91,  85,  78,  72,  66,  60,  54,  47,  41,  35,  29,  23,  16,  10,   1 ],
    [ 144, 137, 130, 124, 113, 107, 101,  95,  88,  82,  76,  70,  64,  57,  51,  45,  39,  33,  26,  15,   1 ],
    [ 152, 145, 138, 132, 123, 117, 111, 105,  98,  92,  86,  80,  74,  67,  61,  55,  49,  43,  36,  20,   1 ],
    [ 162, 155, 148, 142, 133, 127, 121, 115, 108, 102,  96,  90,  84,  77,  71,  65,  59,  53,  46,  30,   1 ],
    [ 172, 165, 158, 152, 143, 137, 131, 125, 118, 112, 106, 100,  94,  87,  81,  75,  69,  63,  56,  45,  20 ],
    [ 200, 200, 200, 200, 200, 200, 200, 200, 198, 193, 188, 183, 178, 173, 168, 163, 158, 153, 148, 129, 104 ],
];

/// Spread decision probabilities.
pub(crate) const SPREAD_ICDF: [u8; 4] = [25, 23, 2, 0];

/// Allocation trim probabilities, centered on trim 5.
pub(crate) const TRIM_ICDF: [u8; 11] = [126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0];

/// Postfilter tapset probabilities.
pub(crate) const TAPSET_ICDF: [u8; 3] = [2, 1, 0];

/// Fallback energy delta probabilities when the budget runs low.
pub(crate) const SMALL_ENERGY_ICDF: [u8; 3] = [2, 1, 0];

/// `floor(0.5 + 8 * log2(1 + n))` for the intensity stereo reservation.
pub(crate) const LOG2_FRAC: [u32; 24] = [
    0, 8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29, 30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];

/// Per-band time-frequency resolution adjustments, indexed by
/// `[LM][transient * 4 + tf_select * 2 + tf_changed]`.
pub(crate) const TF_SELECT_TABLE: [[i8; 8]; 4] = [
    [0, -1, 0, -1, 0, -1, 0, -1],
    [0, -1, 0, -2, 1, 0, 1, -1],
    [0, -2, 0, -3, 2, 0, 1, -1],
    [0, -2, 0, -3, 3, 0, 1, -1],
];

/// The postfilter 3x3 tap-gain matrix, row per tapset.
pub(crate) const POSTFILTER_TAPS: [[f32; 3]; 3] = [
    [0.306_640_62, 0.217_041_02, 0.129_638_67],
    [0.463_867_2, 0.268_066_4, 0.0],
    [0.799_804_7, 0.100_097_656, 0.0],
];

/// Returns LM for a legal frame size, or None.
pub(crate) fn lm_from_frame_size(frame_size: usize) -> Option<usize> {
    match frame_size {
        120 => Some(0),
        240 => Some(1),
        480 => Some(2),
        960 => Some(3),
        _ => None,
    }
}

/// The number of coded bands for an audio bandwidth.
pub(crate) fn bands_for_bandwidth(bandwidth: crate::Bandwidth) -> usize {
    match bandwidth {
        crate::Bandwidth::Narrowband => 13,
        crate::Bandwidth::Mediumband => 17,
        crate::Bandwidth::Wideband => 17,
        crate::Bandwidth::Superwideband => 19,
        _ => MAX_BANDS,
    }
}

/// Bits-to-pulses rows, one per codeword dimension.
///
/// Row `n` holds, for every codable pulse count `k`, the codeword cost
/// `round(8 * log2(V(n, k)))` in eighth bits. Rows stop at `MAX_PULSES` or
/// where the codeword index would no longer fit an unsigned 32-bit integer,
/// whichever comes first.
pub(crate) struct PulseCache {
    rows: Vec<Vec<u16>>,
}

impl PulseCache {
    fn new(cwrs: &CwrsTable, max_n: usize) -> Self {
        let rows = (0..=max_n)
            .map(|n| {
                if n == 0 {
                    return vec![0];
                }
                let mut row = vec![0_u16];
                for k in 1..=MAX_PULSES {
                    let v = cwrs.v(n, k);
                    if v >= 1 << 31 {
                        break;
                    }
                    row.push(((v as f64).log2() * 8.0).round() as u16);
                }
                row
            })
            .collect();
        Self { rows }
    }

    /// The largest codable pulse count for the dimension.
    pub(crate) fn max_pulses(&self, n: usize) -> usize {
        self.rows[n].len() - 1
    }

    /// The cost of `k` pulses in dimension `n`, in eighth bits.
    pub(crate) fn pulses2bits(&self, n: usize, k: usize) -> i32 {
        i32::from(self.rows[n][k])
    }

    /// The largest pulse count whose cost does not exceed `bits` eighth
    /// bits, zero if even a single pulse is too expensive.
    pub(crate) fn bits2pulses(&self, n: usize, bits: i32) -> usize {
        let row = &self.rows[n];
        let mut lo = 0;
        let mut hi = row.len() - 1;
        while lo < hi {
            let mid = (lo + hi + 1) >> 1;
            if i32::from(row[mid]) <= bits {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }
}

/// Immutable per-codec mode data shared by the encoder and the decoder.
pub(crate) struct CeltMode {
    /// The rising half of the Vorbis window.
    pub(crate) window: Vec<f32>,
    /// Codebook sizes for the codeword coder.
    pub(crate) cwrs: CwrsTable,
    /// Codeword cost rows.
    pub(crate) cache: PulseCache,
}

impl CeltMode {
    pub(crate) fn new() -> Self {
        let max_n = (EBANDS[MAX_BANDS] - EBANDS[MAX_BANDS - 1]) << 3;
        let cwrs = CwrsTable::new(usize::max(max_n, 32) + 1, MAX_PULSES);
        let cache = PulseCache::new(&cwrs, max_n);

        Self {
            window: crate::celt::mdct::vorbis_window(OVERLAP),
            cwrs,
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_band_layout() {
        assert_eq!(EBANDS[MAX_BANDS], 100);
        // Band widths match the documented critical band layout.
        let widths: Vec<usize> = (0..MAX_BANDS).map(|b| EBANDS[b + 1] - EBANDS[b]).collect();
        assert_eq!(
            widths,
            vec![1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 4, 4, 4, 6, 6, 8, 12, 18, 22]
        );
    }

    #[test]
    fn test_lm_mapping() {
        assert_eq!(lm_from_frame_size(120), Some(0));
        assert_eq!(lm_from_frame_size(240), Some(1));
        assert_eq!(lm_from_frame_size(480), Some(2));
        assert_eq!(lm_from_frame_size(960), Some(3));
        assert_eq!(lm_from_frame_size(961), None);
        assert_eq!(lm_from_frame_size(0), None);
    }

    #[test]
    fn test_pulse_cache_monotonic() {
        let mode = CeltMode::new();

        // Dimension 1 is never coded through the cache (it is a pure sign),
        // so strict monotonicity only holds from dimension 2 up.
        for n in [2_usize, 4, 8, 16, 44, 176].iter().copied() {
            let max_k = mode.cache.max_pulses(n);
            assert!(max_k >= 1, "dimension {} has no codable pulses", n);
            let mut last = -1;
            (1..=max_k).for_each(|k| {
                let bits = mode.cache.pulses2bits(n, k);
                assert!(bits > last, "cost rows must increase strictly");
                last = bits;
                // bits2pulses inverts pulses2bits on exact costs.
                assert_eq!(mode.cache.bits2pulses(n, bits), k);
            });
        }
    }

    #[test]
    fn test_pulse_cache_codeword_fits_uint() {
        let mode = CeltMode::new();
        (1..=176_usize).for_each(|n| {
            let max_k = mode.cache.max_pulses(n);
            assert!(mode.cwrs.v(n, max_k) < 1 << 31);
        });
    }

    #[test]
    fn test_tables_are_consistent() {
        // Every ICDF table ends at zero.
        assert_eq!(*SPREAD_ICDF.last().unwrap(), 0);
        assert_eq!(*TRIM_ICDF.last().unwrap(), 0);
        assert_eq!(*TAPSET_ICDF.last().unwrap(), 0);
        // Probability models pair a seed and a decay per band.
        assert_eq!(E_PROB_MODEL_INTRA[0].len(), 2 * MAX_BANDS);
        assert_eq!(E_PROB_MODEL_INTER[0].len(), 2 * MAX_BANDS);
    }
}
