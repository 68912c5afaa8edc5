//! Implements the CELT encoder.

use log::trace;

use crate::celt::alloc::{compute_allocation, init_caps, AllocHints};
use crate::celt::bands::{compute_band_energies, normalise_bands, quant_all_bands};
use crate::celt::energy::{
    quant_coarse_energy, quant_energy_finalise, quant_fine_energy, ENERGY_CEILING, ENERGY_FLOOR,
};
use crate::celt::mdct::Mdct;
use crate::celt::mode::{
    bands_for_bandwidth, lm_from_frame_size, CeltMode, EBANDS, MAX_BANDS, MAX_FRAME_SIZE, OVERLAP,
    PREEMPHASIS, SHORT_BLOCK_SIZE, SIG_SCALE, SPREAD_ICDF, TRIM_ICDF,
};
use crate::celt::pvq::Spread;
use crate::celt::tf::{tf_analysis, tf_code};
use crate::celt::Coder;
use crate::range_coder::{RangeEncoder, Tell};
use crate::{Bandwidth, Channels, EncoderError, SignalType};

/// The largest payload a single frame may occupy.
const MAX_PAYLOAD_BYTES: usize = 1275;
/// The band energy floor used for silent frames.
const SILENCE_FLOOR: f32 = -28.0;

/// The last frame's analysis snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameAnalysis {
    /// How strongly the frame leans on time resolution, in [0, 1).
    pub tf_estimate: f32,
    /// Tonality of the frame after the transient clamp, in [0, 1].
    pub toneishness: f32,
    /// Whether the frame was coded with short blocks.
    pub transient: bool,
}

/// The CELT encoder.
pub(crate) struct CeltEncoder {
    channels: Channels,
    end_band: usize,
    mode: CeltMode,
    mdcts: [Mdct; 4],

    // Rate control and analysis knobs.
    bitrate: u32,
    use_vbr: bool,
    use_cvbr: bool,
    complexity: u32,
    signal_type: SignalType,
    pkt_loss_pct: u32,

    /// Quantized band energies of the last frame.
    prev_energy: [[f32; MAX_BANDS]; 2],
    prev_log_e: [[f32; MAX_BANDS]; 2],
    prev_log_e2: [[f32; MAX_BANDS]; 2],
    /// Pre-emphasized input tail, the transform lookback.
    in_mem: [Vec<f32>; 2],
    /// Pre-emphasis filter state (last raw scaled sample).
    preemph_state: [f32; 2],
    /// Folding RNG, kept in lockstep with the decoder.
    rng: u32,
    /// Frames encoded since the last reset.
    frame_count: u64,
    /// Consecutive transient frames, gating anti-collapse.
    consec_transient: u32,
    /// Coded band count of the previous frame, for skip hysteresis.
    prev_coded_bands: usize,
    /// VBR bit reservoir in eighth bits.
    vbr_reservoir: i32,
    /// Analysis snapshot of the last encoded frame.
    analysis: FrameAnalysis,

    // Frame-sized scratch, allocated once.
    samples: Vec<f32>,
    freq: Vec<f32>,
    block_coeffs: Vec<f32>,
    norm_scratch: Vec<f32>,
}

impl CeltEncoder {
    /// Creates a new CELT encoder.
    pub(crate) fn new(channels: Channels, bandwidth: Bandwidth) -> Result<Self, EncoderError> {
        Ok(Self {
            channels,
            end_band: bands_for_bandwidth(bandwidth),
            mode: CeltMode::new(),
            mdcts: [
                Mdct::new(120, OVERLAP),
                Mdct::new(240, OVERLAP),
                Mdct::new(480, OVERLAP),
                Mdct::new(960, OVERLAP),
            ],
            bitrate: 64000,
            use_vbr: false,
            use_cvbr: false,
            complexity: 5,
            signal_type: SignalType::Auto,
            pkt_loss_pct: 0,
            prev_energy: [[0.0; MAX_BANDS]; 2],
            prev_log_e: [[SILENCE_FLOOR; MAX_BANDS]; 2],
            prev_log_e2: [[SILENCE_FLOOR; MAX_BANDS]; 2],
            in_mem: [vec![0.0; OVERLAP], vec![0.0; OVERLAP]],
            preemph_state: [0.0; 2],
            rng: 0,
            frame_count: 0,
            consec_transient: 0,
            prev_coded_bands: MAX_BANDS,
            vbr_reservoir: 0,
            analysis: FrameAnalysis::default(),
            samples: vec![0.0; 2 * (MAX_FRAME_SIZE + OVERLAP)],
            freq: vec![0.0; 2 * MAX_FRAME_SIZE],
            block_coeffs: vec![0.0; MAX_FRAME_SIZE],
            norm_scratch: vec![0.0; 2 * (EBANDS[MAX_BANDS - 1] << 3)],
        })
    }

    /// Resets all encoder state, as if freshly constructed.
    pub(crate) fn reset(&mut self) {
        self.prev_energy = [[0.0; MAX_BANDS]; 2];
        self.prev_log_e = [[SILENCE_FLOOR; MAX_BANDS]; 2];
        self.prev_log_e2 = [[SILENCE_FLOOR; MAX_BANDS]; 2];
        self.in_mem
            .iter_mut()
            .for_each(|mem| mem.iter_mut().for_each(|v| *v = 0.0));
        self.preemph_state = [0.0; 2];
        self.rng = 0;
        self.frame_count = 0;
        self.consec_transient = 0;
        self.prev_coded_bands = MAX_BANDS;
        self.vbr_reservoir = 0;
        self.analysis = FrameAnalysis::default();
    }

    /// Sets the target bitrate in bits per second.
    pub(crate) fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate.clamp(6000, 510_000);
    }

    /// Enables or disables variable bitrate coding.
    pub(crate) fn set_vbr(&mut self, use_vbr: bool, constrained: bool) {
        self.use_vbr = use_vbr;
        self.use_cvbr = constrained;
    }

    /// Sets the encoder search complexity, 0 to 10.
    pub(crate) fn set_complexity(&mut self, complexity: u32) {
        self.complexity = complexity.min(10);
    }

    /// Biases the allocation for speech or music.
    pub(crate) fn set_signal_type(&mut self, signal_type: SignalType) {
        self.signal_type = signal_type;
    }

    /// Sets the expected packet loss percentage.
    pub(crate) fn set_packet_loss_pct(&mut self, pct: u32) {
        self.pkt_loss_pct = pct.min(100);
    }

    /// Limits the coded bandwidth.
    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.end_band = bands_for_bandwidth(bandwidth);
    }

    /// The analysis snapshot of the last encoded frame.
    pub(crate) fn analysis(&self) -> FrameAnalysis {
        self.analysis
    }

    /// Encodes one frame of interleaved samples in [-1, 1] and returns the
    /// number of bytes written.
    pub(crate) fn encode_frame(
        &mut self,
        pcm: &[f32],
        frame_size: usize,
        output: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let lm = lm_from_frame_size(frame_size).ok_or(EncoderError::InvalidFrameSize)?;
        let channels = if self.channels == Channels::Stereo { 2 } else { 1 };
        if pcm.len() < channels * frame_size {
            return Err(EncoderError::InternalError("input too short"));
        }

        let nb_bytes = self.target_bytes(frame_size, output.len())?;
        let (payload, _) = output.split_at_mut(nb_bytes);
        let mut enc = RangeEncoder::new(payload);

        self.encode_impl(&mut enc, pcm, frame_size, lm, channels, 0)?;

        enc.done()?;
        let range = enc.final_range();
        drop(enc);
        self.rng = crate::celt::bands::lcg_rand(self.rng ^ range);

        Ok(nb_bytes)
    }

    /// Encodes the CELT part of a hybrid frame into a range encoder the
    /// speech layer has already written to. Only bands 17 and up are coded.
    pub(crate) fn encode_frame_hybrid(
        &mut self,
        enc: &mut RangeEncoder,
        pcm: &[f32],
        frame_size: usize,
    ) -> Result<(), EncoderError> {
        let lm = lm_from_frame_size(frame_size).ok_or(EncoderError::InvalidFrameSize)?;
        let channels = if self.channels == Channels::Stereo { 2 } else { 1 };
        if pcm.len() < channels * frame_size {
            return Err(EncoderError::InternalError("input too short"));
        }

        self.encode_impl(enc, pcm, frame_size, lm, channels, 17)?;
        // The decoder reseeds its folding RNG at the same point.
        self.rng = crate::celt::bands::lcg_rand(self.rng ^ enc.final_range());
        Ok(())
    }

    /// Picks the payload size for this frame.
    fn target_bytes(&mut self, frame_size: usize, available: usize) -> Result<usize, EncoderError> {
        let base_bits = (self.bitrate as u64 * frame_size as u64 / 48_000) as i32;
        let mut bits = base_bits;

        if self.use_vbr {
            // Spend the reservoir on transient frames, save on tonal ones.
            let boost = if self.analysis.transient {
                base_bits / 4
            } else if self.analysis.toneishness > 0.9 {
                -base_bits / 8
            } else {
                0
            };
            bits += boost;
            self.vbr_reservoir -= boost * 8;
            if self.use_cvbr {
                // A constrained stream may only drift by one frame's worth.
                bits = bits.clamp(base_bits - base_bits / 4, base_bits + base_bits / 4);
            }
        }

        let bytes = ((bits + 7) / 8).max(8) as usize;
        let bytes = bytes.min(MAX_PAYLOAD_BYTES).min(available);
        if bytes < 2 {
            return Err(EncoderError::BufferTooSmall);
        }
        Ok(bytes)
    }

    /// The shared frame body, mirroring the decoder's controller stage by
    /// stage.
    fn encode_impl(
        &mut self,
        enc: &mut RangeEncoder,
        pcm: &[f32],
        frame_size: usize,
        lm: usize,
        channels: usize,
        start: usize,
    ) -> Result<(), EncoderError> {
        let end = usize::max(self.end_band, start + 1);
        let total_bits = enc.storage_bits();

        // Pre-emphasis into the lapped analysis buffer.
        let silence_in = self.preemphasis(pcm, frame_size, channels);

        // Header flags.
        let tell = enc.tell();
        if start == 0 && tell == 1 {
            enc.encode_bit_logp(u32::from(silence_in), 15)?;
            if silence_in {
                trace!("encoding silence frame");
                (0..2).for_each(|c| {
                    self.prev_energy[c] = [SILENCE_FLOOR; MAX_BANDS];
                    self.prev_log_e[c] = [SILENCE_FLOOR; MAX_BANDS];
                    self.prev_log_e2[c] = [SILENCE_FLOOR; MAX_BANDS];
                });
                self.analysis = FrameAnalysis::default();
                self.frame_count += 1;
                return Ok(());
            }
        }

        // Transient and tone analysis.
        let (mut transient, tf_estimate) = self.transient_analysis(frame_size, channels, lm);
        let mut toneishness = self.tone_analysis(frame_size, channels);
        // A highly tonal frame gains nothing from short blocks, but the
        // detector overestimates tonality exactly when the time envelope is
        // busy, so cap it by the transient evidence first.
        toneishness = f32::min(toneishness, 1.0 - tf_estimate);
        if toneishness > 0.98 {
            transient = false;
        }
        if self.complexity == 0 {
            transient = false;
        }

        if start == 0 && enc.tell() + 16 <= total_bits {
            // No prefilter in this encoder; signal an unmodified frame.
            enc.encode_bit_logp(0, 1)?;
        }
        if lm > 0 && enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(transient), 3)?;
        } else {
            transient = false;
        }

        let intra = self.frame_count == 0
            || (self.pkt_loss_pct > 0
                && self.frame_count % u64::max(1, 100 / u64::from(self.pkt_loss_pct)) == 0);
        if enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(intra), 3)?;
        }

        trace!(
            "frame {}: lm {}, transient {}, intra {}, tf_estimate {:.3}",
            self.frame_count,
            lm,
            transient,
            intra,
            tf_estimate
        );

        // Forward transform.
        let blocks = if transient { 1 << lm } else { 1 };
        self.forward_transform(frame_size, channels, lm, blocks);

        // Band energies and normalization.
        let mut amps = [[0.0_f32; MAX_BANDS]; 2];
        let mut band_log_e = [[0.0_f32; MAX_BANDS]; 2];
        for c in 0..channels {
            let freq_c = &mut self.freq[c * MAX_FRAME_SIZE..c * MAX_FRAME_SIZE + frame_size];
            compute_band_energies(freq_c, lm, end, &mut amps[c], &mut band_log_e[c]);
            (0..end).for_each(|band| {
                band_log_e[c][band] = band_log_e[c][band].clamp(ENERGY_FLOOR, ENERGY_CEILING);
            });
            normalise_bands(freq_c, lm, end, &amps[c]);
        }

        // Coarse energy.
        let mut energies = self.prev_energy;
        let mut energy_error = [[0.0_f32; MAX_BANDS]; 2];
        quant_coarse_energy(
            enc,
            lm,
            start,
            end,
            channels,
            intra,
            &band_log_e,
            &mut energies,
            &mut energy_error,
            total_bits,
        )?;

        // Per-band time-frequency resolution.
        let mut tf_res = [0_i8; MAX_BANDS];
        let mut tf_select = false;
        if self.complexity >= 2 && lm > 0 {
            let mut offsets = [(0_usize, 0_usize); MAX_BANDS];
            (start..end).for_each(|band| {
                offsets[band - start] =
                    (EBANDS[band] << lm, (EBANDS[band + 1] - EBANDS[band]) << lm);
            });
            let mut flags = [0_i8; MAX_BANDS];
            tf_analysis(
                &self.freq[..MAX_FRAME_SIZE],
                &offsets[..end - start],
                transient,
                &mut flags,
            );
            (start..end).for_each(|band| {
                tf_res[band] = flags[band - start];
            });
            tf_select = transient;
        }
        {
            let mut coder = Coder::Enc(&mut *enc);
            tf_code(
                &mut coder,
                start,
                end,
                lm,
                transient,
                total_bits,
                &mut tf_res,
                tf_select,
            )?;
        }

        // Spread decision.
        let spread = if enc.tell() + 4 <= total_bits {
            let spread = self.spread_decision(frame_size, lm, end);
            enc.encode_icdf(spread as usize, &SPREAD_ICDF, 5)?;
            spread
        } else {
            Spread::Normal
        };

        // Dynamic allocation boosts. The allocator must see exactly the
        // boosts that made it into the stream, so they are recorded from
        // the coding loop itself.
        let mut caps = [0_i32; MAX_BANDS];
        init_caps(&mut caps, lm, channels);
        let wanted = self.dynalloc_analysis(&band_log_e, channels, start, end, lm, &caps);
        let mut dyn_offsets = [0_i32; MAX_BANDS];
        let mut total_q3 = (total_bits as i32) << 3;
        let mut dynalloc_logp = 6_u32;
        for band in start..end {
            let width = (channels * ((EBANDS[band + 1] - EBANDS[band]) << lm)) as i32;
            let quanta = i32::min(width << 3, i32::max(6 << 3, width));
            let mut loop_logp = dynalloc_logp;
            let mut remaining = wanted[band];
            let mut boost = 0;
            while (enc.tell_frac() as i32) + ((loop_logp as i32) << 3) < total_q3
                && boost < caps[band]
            {
                let flag = remaining >= quanta;
                enc.encode_bit_logp(u32::from(flag), loop_logp)?;
                if !flag {
                    break;
                }
                remaining -= quanta;
                boost += quanta;
                total_q3 -= quanta;
                loop_logp = 1;
            }
            dyn_offsets[band] = boost;
            if boost > 0 {
                dynalloc_logp = u32::max(2, dynalloc_logp - 1);
            }
        }

        // Allocation trim.
        let trim = self.trim_decision(&band_log_e, channels, end, lm);
        let trim = if (enc.tell_frac() as i32) + (6 << 3) <= total_q3 {
            enc.encode_icdf(trim as usize, &TRIM_ICDF, 7)?;
            trim
        } else {
            5
        };

        // Anti-collapse reservation.
        let mut shape_bits = ((total_bits as i32) << 3) - enc.tell_frac() as i32 - 1;
        let anti_collapse_rsv = if transient && lm >= 2 && shape_bits >= ((lm as i32) + 2) << 3 {
            1 << 3
        } else {
            0
        };
        shape_bits -= anti_collapse_rsv;

        // The allocator. The decoder runs the identical routine.
        let hints = AllocHints {
            intensity: end,
            dual_stereo: false,
            prev_coded_bands: self.prev_coded_bands,
            signal_bandwidth: end - 1,
        };
        let alloc = {
            let mut coder = Coder::Enc(&mut *enc);
            compute_allocation(
                &mut coder,
                start,
                end,
                lm,
                channels,
                &dyn_offsets,
                &caps,
                trim,
                shape_bits,
                hints,
            )?
        };
        self.prev_coded_bands = alloc.coded_bands;

        // Fine energy.
        quant_fine_energy(
            enc,
            start,
            end,
            channels,
            &alloc.fine_quant,
            &mut energies,
            &mut energy_error,
        )?;

        // Band shapes.
        let spectrum_len = EBANDS[MAX_BANDS] << lm;
        let mut collapse_masks = [0_u8; 2 * MAX_BANDS];
        {
            let (x_half, y_half) = self.freq.split_at_mut(MAX_FRAME_SIZE);
            let x = &mut x_half[..spectrum_len];
            let y = if channels == 2 {
                Some(&mut y_half[..spectrum_len])
            } else {
                None
            };
            let mut coder = Coder::Enc(&mut *enc);
            let mut seed = self.rng;
            quant_all_bands(
                &mut coder,
                &self.mode,
                start,
                end,
                x,
                y,
                &mut collapse_masks,
                &amps,
                &alloc.pulses,
                transient,
                spread,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                ((total_bits as i32) << 3) - anti_collapse_rsv,
                alloc.balance,
                lm,
                alloc.coded_bands,
                &mut seed,
                false,
                &mut self.norm_scratch,
            )?;
            self.rng = seed;
        }

        // Anti-collapse flag.
        if anti_collapse_rsv > 0 {
            let anti_collapse_on = u32::from(self.consec_transient < 2);
            enc.encode_bits(anti_collapse_on, 1)?;
        }

        // Whatever is left refines the energies once more.
        let bits_left = (total_bits as i32) - enc.tell() as i32;
        quant_energy_finalise(
            enc,
            start,
            end,
            channels,
            &alloc.fine_quant,
            &alloc.fine_priority,
            bits_left,
            &mut energies,
            &mut energy_error,
        )?;

        // Energy history, mirroring the decoder.
        (0..channels).for_each(|c| {
            (start..end).for_each(|band| {
                energies[c][band] = energies[c][band].clamp(ENERGY_FLOOR, ENERGY_CEILING);
            });
            self.prev_energy[c] = energies[c];
            if transient {
                (0..MAX_BANDS).for_each(|band| {
                    self.prev_log_e[c][band] =
                        f32::min(self.prev_log_e[c][band], energies[c][band]);
                });
            } else {
                self.prev_log_e2[c] = self.prev_log_e[c];
                self.prev_log_e[c] = energies[c];
            }
            (0..start).chain(end..MAX_BANDS).for_each(|band| {
                self.prev_energy[c][band] = 0.0;
                self.prev_log_e[c][band] = SILENCE_FLOOR;
                self.prev_log_e2[c][band] = SILENCE_FLOOR;
            });
        });
        if channels == 1 {
            self.prev_energy[1] = self.prev_energy[0];
        }

        self.consec_transient = if transient {
            self.consec_transient + 1
        } else {
            0
        };
        self.frame_count += 1;
        self.analysis = FrameAnalysis {
            tf_estimate,
            toneishness,
            transient,
        };

        Ok(())
    }

    /// Pre-emphasizes the input into the lapped analysis buffer and
    /// reports whether the frame is digital silence.
    fn preemphasis(&mut self, pcm: &[f32], frame_size: usize, channels: usize) -> bool {
        let mut silence = true;
        for c in 0..channels {
            let buf = &mut self.samples[c * (MAX_FRAME_SIZE + OVERLAP)..];
            buf[..OVERLAP].copy_from_slice(&self.in_mem[c]);

            let mut state = self.preemph_state[c];
            (0..frame_size).for_each(|i| {
                let x = pcm[i * channels + c] * SIG_SCALE;
                if x != 0.0 {
                    silence = false;
                }
                buf[OVERLAP + i] = x - PREEMPHASIS * state;
                state = x;
            });
            self.preemph_state[c] = state;

            self.in_mem[c]
                .copy_from_slice(&buf[frame_size..frame_size + OVERLAP]);
        }
        silence
    }

    /// Runs the forward MDCT over one or several blocks, interleaving the
    /// short-block coefficients.
    fn forward_transform(&mut self, frame_size: usize, channels: usize, lm: usize, blocks: usize) {
        let block_size = frame_size / blocks;
        debug_assert!(blocks == 1 || block_size == SHORT_BLOCK_SIZE);
        let mdct = if blocks > 1 {
            &mut self.mdcts[0]
        } else {
            &mut self.mdcts[lm]
        };
        let window = &self.mode.window;

        for c in 0..channels {
            let input = &self.samples[c * (MAX_FRAME_SIZE + OVERLAP)..];
            let freq_c = &mut self.freq[c * MAX_FRAME_SIZE..c * MAX_FRAME_SIZE + frame_size];
            let coeffs = &mut self.block_coeffs[..block_size];

            for b in 0..blocks {
                let span = &input[b * block_size..b * block_size + block_size + OVERLAP];
                mdct.forward(span, window, coeffs);
                (0..block_size).for_each(|i| {
                    freq_c[i * blocks + b] = coeffs[i];
                });
            }
        }
    }

    /// A block-energy attack detector on the high-passed input.
    ///
    /// Returns the transient decision and the time-resolution estimate.
    fn transient_analysis(
        &self,
        frame_size: usize,
        channels: usize,
        lm: usize,
    ) -> (bool, f32) {
        const BLOCK: usize = 16;
        const DECAY: f32 = 0.5;

        let mut tf_max = 1.0_f32;
        for c in 0..channels {
            let buf = &self.samples[c * (MAX_FRAME_SIZE + OVERLAP) + OVERLAP..];
            let mut masked = 0.0_f32;
            let mut prev = 0.0_f32;
            let mut j = 0;
            while j + BLOCK <= frame_size {
                let mut e = 0.0_f32;
                (j..j + BLOCK).for_each(|i| {
                    let d = buf[i] - prev;
                    prev = buf[i];
                    e += d * d;
                });
                if masked > 0.0 {
                    let ratio = e / (1e-15 + DECAY * masked);
                    tf_max = f32::max(tf_max, ratio);
                }
                masked = f32::max(e, DECAY * masked);
                j += BLOCK;
            }
        }

        let transient = lm > 0 && tf_max > 8.0;
        let tf_estimate = 1.0 - 1.0 / tf_max.max(1.0).sqrt();
        (transient, tf_estimate)
    }

    /// Normalized lag-1 autocorrelation of the raw frame, squared. Close to
    /// one for pure tones.
    fn tone_analysis(&self, frame_size: usize, channels: usize) -> f32 {
        let mut num = 0.0_f32;
        let mut den = 1e-15_f32;
        for c in 0..channels {
            let buf = &self.samples[c * (MAX_FRAME_SIZE + OVERLAP) + OVERLAP..];
            (1..frame_size).for_each(|i| {
                num += buf[i] * buf[i - 1];
                den += buf[i] * buf[i];
            });
        }
        let r = (num / den).max(0.0);
        r * r
    }

    /// Chooses the folding rotation strength from the average sparsity of
    /// the normalized shapes.
    fn spread_decision(&self, frame_size: usize, lm: usize, end: usize) -> Spread {
        if self.complexity < 3 {
            return Spread::Normal;
        }

        // Mean ratio between L1 and the L1 a flat band would have. Tonal
        // spectra are sparse, so the ratio drops well below one.
        let mut sparsity = 0.0_f32;
        let mut count = 0;
        (0..end).for_each(|band| {
            let lo = EBANDS[band] << lm;
            let hi = (EBANDS[band + 1] << lm).min(frame_size);
            let n = hi - lo;
            if n < 8 {
                return;
            }
            let l1: f32 = self.freq[lo..hi].iter().map(|v| v.abs()).sum();
            sparsity += l1 / (n as f32).sqrt();
            count += 1;
        });
        if count == 0 {
            return Spread::Normal;
        }
        sparsity /= count as f32;

        if sparsity < 0.3 {
            Spread::None
        } else if sparsity < 0.5 {
            Spread::Light
        } else if sparsity < 0.8 {
            Spread::Normal
        } else {
            Spread::Aggressive
        }
    }

    /// Boosts bands whose energy pops out of the smoothed envelope.
    fn dynalloc_analysis(
        &self,
        band_log_e: &[[f32; MAX_BANDS]; 2],
        channels: usize,
        start: usize,
        end: usize,
        lm: usize,
        caps: &[i32; MAX_BANDS],
    ) -> [i32; MAX_BANDS] {
        let mut offsets = [0_i32; MAX_BANDS];
        if self.complexity < 2 || end - start < 3 {
            return offsets;
        }

        for c in 0..channels {
            // A two-sided follower tracks the envelope; a band far above it
            // is perceptually important and gets extra bits.
            let mut follower = [0.0_f32; MAX_BANDS];
            let mut f = band_log_e[c][start];
            (start..end).for_each(|band| {
                f = f32::max(f - 1.5, band_log_e[c][band]);
                follower[band] = f;
            });
            let mut b = band_log_e[c][end - 1];
            (start..end).rev().for_each(|band| {
                b = f32::max(b - 1.5, band_log_e[c][band]);
                follower[band] = f32::min(follower[band], b);
            });

            (start..end).for_each(|band| {
                let surprise = band_log_e[c][band] - follower[band];
                if surprise > 2.0 {
                    let width = ((EBANDS[band + 1] - EBANDS[band]) << lm) as i32;
                    let boost = (((surprise - 2.0) * 0.5) * (width << 3) as f32) as i32;
                    offsets[band] = (offsets[band] + boost).min(caps[band] / 2);
                }
            });
        }

        offsets
    }

    /// Allocation tilt from the spectral slope and the signal type.
    fn trim_decision(
        &self,
        band_log_e: &[[f32; MAX_BANDS]; 2],
        channels: usize,
        end: usize,
        _lm: usize,
    ) -> i32 {
        // Average energy slope across the bands, in log2 units per band.
        let mut slope = 0.0_f32;
        let mut count = 0;
        (0..channels).for_each(|c| {
            (1..end).for_each(|band| {
                slope += band_log_e[c][band] - band_log_e[c][band - 1];
                count += 1;
            });
        });
        if count > 0 {
            slope /= count as f32;
        }

        let bias = match self.signal_type {
            SignalType::Voice => -1,
            SignalType::Music => 1,
            SignalType::Auto => 0,
        };

        // A falling spectrum wants the bits at the bottom, which is the
        // above-neutral side of the trim scale.
        let trim = 5.0 - 4.0 * slope;
        (trim as i32 + bias).clamp(0, 10)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use std::f32::consts::PI;

    use super::*;
    use crate::celt::decoder::CeltDecoder;

    fn new_pair(channels: Channels) -> (CeltEncoder, CeltDecoder) {
        (
            CeltEncoder::new(channels, Bandwidth::Fullband).unwrap(),
            CeltDecoder::new(channels, Bandwidth::Fullband).unwrap(),
        )
    }

    fn sine(frequency: f32, frame_size: usize, frames: usize) -> Vec<f32> {
        (0..frame_size * frames)
            .map(|i| (2.0 * PI * frequency * i as f32 / 48_000.0).sin() * 0.8)
            .collect()
    }

    #[test]
    fn test_invalid_frame_size() {
        let (mut enc, _) = new_pair(Channels::Mono);
        let pcm = vec![0.0_f32; 1000];
        let mut out = vec![0_u8; 400];
        assert!(matches!(
            enc.encode_frame(&pcm, 1000, &mut out),
            Err(EncoderError::InvalidFrameSize)
        ));
    }

    #[test]
    fn test_cbr_size_is_stable() {
        let (mut enc, _) = new_pair(Channels::Mono);
        enc.set_bitrate(64_000);
        let pcm = sine(440.0, 960, 4);
        let mut out = vec![0_u8; 400];

        let mut sizes = Vec::new();
        (0..4).for_each(|f| {
            let n = enc
                .encode_frame(&pcm[f * 960..(f + 1) * 960], 960, &mut out)
                .unwrap();
            sizes.push(n);
        });

        // 64 kb/s at 20 ms is 160 bytes per frame.
        sizes.iter().for_each(|&n| assert_eq!(n, 160));
    }

    /// Digital silence encodes the silence flag and decodes to silence.
    #[test]
    fn test_silence_roundtrip() {
        let (mut enc, mut dec) = new_pair(Channels::Mono);
        let pcm = vec![0.0_f32; 960];
        let mut packet = vec![0_u8; 400];

        let n = enc.encode_frame(&pcm, 960, &mut packet).unwrap();
        let mut out = vec![1.0_f32; 960];
        dec.decode_frame(&packet[..n], 960, &mut out).unwrap();

        out.iter().for_each(|&v| {
            assert!(v.abs() < 1e-6);
        });
    }

    /// A 440 Hz sine at 64 kb/s mono must come back at more than 20 dB
    /// SNR once the lapped transform has settled, and the tone detector
    /// must not report an unclamped pure tone.
    #[test]
    fn test_sine_roundtrip_quality() {
        let (mut enc, mut dec) = new_pair(Channels::Mono);
        enc.set_bitrate(64_000);
        enc.set_complexity(10);

        let frames = 10;
        let pcm = sine(440.0, 960, frames);
        let mut packet = vec![0_u8; 400];
        let mut decoded = vec![0.0_f32; 960 * frames];

        (0..frames).for_each(|f| {
            let n = enc
                .encode_frame(&pcm[f * 960..(f + 1) * 960], 960, &mut packet)
                .unwrap();
            dec.decode_frame(&packet[..n], 960, &mut decoded[f * 960..(f + 1) * 960])
                .unwrap();
        });

        let analysis = enc.analysis();
        assert!(
            f32::min(analysis.toneishness, 1.0 - analysis.tf_estimate) < 0.98,
            "tone detection not clamped: toneishness {}, tf_estimate {}",
            analysis.toneishness,
            analysis.tf_estimate
        );

        // The decoder output is delayed by the overlap; skip the first two
        // frames for the transform and the pre-emphasis transient.
        let delay = OVERLAP;
        let mut signal = 0.0_f64;
        let mut noise = 0.0_f64;
        (2 * 960..(frames - 1) * 960).for_each(|i| {
            let x = f64::from(pcm[i - delay]);
            let y = f64::from(decoded[i]);
            signal += x * x;
            noise += (x - y) * (x - y);
        });
        let snr = 10.0 * (signal / noise.max(1e-12)).log10();
        assert!(snr > 20.0, "SNR {} dB", snr);
    }

    /// Stereo content survives a roundtrip with sensible correlation per
    /// channel.
    #[test]
    fn test_stereo_roundtrip() {
        let (mut enc, mut dec) = new_pair(Channels::Stereo);
        enc.set_bitrate(128_000);

        let frames = 6;
        let mono = sine(523.25, 480, frames);
        let mut pcm = vec![0.0_f32; 2 * 480 * frames];
        (0..480 * frames).for_each(|i| {
            pcm[2 * i] = mono[i];
            pcm[2 * i + 1] = -0.5 * mono[i];
        });

        let mut packet = vec![0_u8; 500];
        let mut decoded = vec![0.0_f32; 2 * 480 * frames];
        (0..frames).for_each(|f| {
            let n = enc
                .encode_frame(&pcm[f * 2 * 480..(f + 1) * 2 * 480], 480, &mut packet)
                .unwrap();
            dec.decode_frame(
                &packet[..n],
                480,
                &mut decoded[f * 2 * 480..(f + 1) * 2 * 480],
            )
            .unwrap();
        });

        let mut corr_l = 0.0_f64;
        let mut el = 0.0_f64;
        let mut dl = 0.0_f64;
        (2 * 480..(frames - 1) * 480).for_each(|i| {
            let x = f64::from(pcm[2 * (i - OVERLAP)]);
            let y = f64::from(decoded[2 * i]);
            corr_l += x * y;
            el += x * x;
            dl += y * y;
        });
        let corr = corr_l / (el.sqrt() * dl.sqrt()).max(1e-12);
        assert!(corr > 0.7, "left channel correlation {}", corr);
    }

    /// Every payload size the rate control can produce decodes back without
    /// errors at every frame size.
    #[test]
    fn test_bitrates_and_frame_sizes_roundtrip() {
        for &frame_size in &[120_usize, 240, 480, 960] {
            for &bitrate in &[16_000_u32, 48_000, 96_000, 256_000] {
                let (mut enc, mut dec) = new_pair(Channels::Mono);
                enc.set_bitrate(bitrate);

                let pcm = sine(997.0, frame_size, 3);
                let mut packet = vec![0_u8; 1400];
                let mut out = vec![0.0_f32; frame_size];

                (0..3).for_each(|f| {
                    let n = enc
                        .encode_frame(
                            &pcm[f * frame_size..(f + 1) * frame_size],
                            frame_size,
                            &mut packet,
                        )
                        .unwrap();
                    assert!(n >= 8);
                    dec.decode_frame(&packet[..n], frame_size, &mut out).unwrap();
                    out.iter().for_each(|v| assert!(v.is_finite()));
                });
            }
        }
    }

    /// The encoder-side range state must match the decoder's after each
    /// frame, which is what keeps the folding RNGs in lockstep.
    #[test]
    fn test_rng_stays_in_lockstep() {
        let (mut enc, mut dec) = new_pair(Channels::Mono);
        enc.set_bitrate(48_000);
        let pcm = sine(660.0, 480, 5);
        let mut packet = vec![0_u8; 400];
        let mut out = vec![0.0_f32; 480];

        (0..5).for_each(|f| {
            let n = enc
                .encode_frame(&pcm[f * 480..(f + 1) * 480], 480, &mut packet)
                .unwrap();
            dec.decode_frame(&packet[..n], 480, &mut out).unwrap();
            assert_eq!(enc.rng, dec_rng(&dec), "frame {}", f);
        });
    }

    fn dec_rng(dec: &CeltDecoder) -> u32 {
        // The decoder field is private to the module; reach through the
        // crate-internal accessor used only by tests.
        dec.test_rng()
    }

    /// A transient (castanet-like click train) flips the transient flag and
    /// still roundtrips.
    #[test]
    fn test_transient_encoding() {
        let (mut enc, mut dec) = new_pair(Channels::Mono);
        enc.set_bitrate(96_000);

        let mut pcm = vec![0.0_f32; 960 * 2];
        // A silent lead-in, then a sharp burst in the second frame.
        (960 + 600..960 + 680).for_each(|i| {
            pcm[i] = if i % 2 == 0 { 0.9 } else { -0.9 };
        });

        let mut packet = vec![0_u8; 400];
        let mut out = vec![0.0_f32; 960];
        let n = enc.encode_frame(&pcm[..960], 960, &mut packet).unwrap();
        dec.decode_frame(&packet[..n], 960, &mut out).unwrap();

        let n = enc.encode_frame(&pcm[960..], 960, &mut packet).unwrap();
        assert!(enc.analysis().transient, "burst not detected as transient");
        dec.decode_frame(&packet[..n], 960, &mut out).unwrap();
        out.iter().for_each(|v| assert!(v.is_finite()));
    }
}
