//! Implements the CELT decoder.

use log::trace;

use crate::celt::alloc::{compute_allocation, init_caps, AllocHints};
use crate::celt::bands::{anti_collapse, denormalise_bands, lcg_rand, quant_all_bands};
use crate::celt::comb_filter::{comb_filter_inplace, COMBFILTER_MAXPERIOD, COMBFILTER_MINPERIOD};
use crate::celt::energy::{
    unquant_coarse_energy, unquant_energy_finalise, unquant_fine_energy, ENERGY_CEILING,
    ENERGY_FLOOR,
};
use crate::celt::mdct::Mdct;
use crate::celt::mode::{
    bands_for_bandwidth, lm_from_frame_size, CeltMode, EBANDS, MAX_BANDS, MAX_FRAME_SIZE, OVERLAP,
    PREEMPHASIS, SHORT_BLOCK_SIZE, SIG_SCALE, SPREAD_ICDF, TAPSET_ICDF, TRIM_ICDF,
};
use crate::celt::pvq::Spread;
use crate::celt::tf::tf_code;
use crate::celt::Coder;
use crate::range_coder::{RangeDecoder, Tell};
use crate::{Bandwidth, Channels, DecoderError};

/// Denormal protection added inside the de-emphasis filter.
const VERY_SMALL: f32 = 1e-30;
/// Samples of synthesis history kept for the pitch postfilter.
const DECODE_BUFFER_SIZE: usize = 2048;
/// The band energy floor used for silent frames and empty history.
const SILENCE_FLOOR: f32 = -28.0;

/// Per-frame header flags and parameters.
struct FrameHeader {
    silence: bool,
    postfilter_period: usize,
    postfilter_gain: f32,
    postfilter_tapset: usize,
    transient: bool,
    intra: bool,
}

/// The CELT decoder.
pub(crate) struct CeltDecoder {
    channels: Channels,
    end_band: usize,
    mode: CeltMode,
    mdcts: [Mdct; 4],

    /// Quantized band energies of the last frame.
    prev_energy: [[f32; MAX_BANDS]; 2],
    /// Energy history for the anti-collapse processor.
    prev_log_e: [[f32; MAX_BANDS]; 2],
    prev_log_e2: [[f32; MAX_BANDS]; 2],
    /// Synthesis history, one buffer per channel.
    decode_mem: [Vec<f32>; 2],
    /// De-emphasis filter state.
    preemph_state: [f32; 2],

    postfilter_period: usize,
    postfilter_gain: f32,
    postfilter_tapset: usize,
    postfilter_period_old: usize,
    postfilter_gain_old: f32,
    postfilter_tapset_old: usize,

    /// Folding RNG, reseeded from the final range of every frame.
    rng: u32,
    /// Whether the previous packet was stereo, to detect transitions.
    prev_packet_stereo: bool,

    /// Frequency-domain workspace, both channels back to back.
    freq: Vec<f32>,
    block_coeffs: Vec<f32>,
    block_span: Vec<f32>,
    synthesis: Vec<f32>,
    norm_scratch: Vec<f32>,
}

impl CeltDecoder {
    /// Creates a new CELT decoder.
    pub(crate) fn new(channels: Channels, bandwidth: Bandwidth) -> Result<Self, DecoderError> {
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
            prev_energy: [[0.0; MAX_BANDS]; 2],
            prev_log_e: [[SILENCE_FLOOR; MAX_BANDS]; 2],
            prev_log_e2: [[SILENCE_FLOOR; MAX_BANDS]; 2],
            decode_mem: [
                vec![0.0; DECODE_BUFFER_SIZE + OVERLAP],
                vec![0.0; DECODE_BUFFER_SIZE + OVERLAP],
            ],
            preemph_state: [0.0; 2],
            postfilter_period: 0,
            postfilter_gain: 0.0,
            postfilter_tapset: 0,
            postfilter_period_old: 0,
            postfilter_gain_old: 0.0,
            postfilter_tapset_old: 0,
            rng: 0,
            prev_packet_stereo: channels == Channels::Stereo,
            freq: vec![0.0; 2 * MAX_FRAME_SIZE],
            block_coeffs: vec![0.0; MAX_FRAME_SIZE],
            block_span: vec![0.0; MAX_FRAME_SIZE + OVERLAP],
            synthesis: vec![0.0; MAX_FRAME_SIZE + OVERLAP],
            norm_scratch: vec![0.0; 2 * (EBANDS[MAX_BANDS - 1] << 3)],
        })
    }

    /// Resets all decoder state, as if freshly constructed.
    pub(crate) fn reset(&mut self) {
        self.prev_energy = [[0.0; MAX_BANDS]; 2];
        self.prev_log_e = [[SILENCE_FLOOR; MAX_BANDS]; 2];
        self.prev_log_e2 = [[SILENCE_FLOOR; MAX_BANDS]; 2];
        self.decode_mem
            .iter_mut()
            .for_each(|mem| mem.iter_mut().for_each(|v| *v = 0.0));
        self.preemph_state = [0.0; 2];
        self.postfilter_period = 0;
        self.postfilter_gain = 0.0;
        self.postfilter_tapset = 0;
        self.postfilter_period_old = 0;
        self.postfilter_gain_old = 0.0;
        self.postfilter_tapset_old = 0;
        self.rng = 0;
        self.prev_packet_stereo = self.channels == Channels::Stereo;
    }

    /// Limits the decoded bandwidth.
    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.end_band = bands_for_bandwidth(bandwidth);
    }

    /// Decodes one frame into `output` (interleaved, `frame_size` samples
    /// per channel).
    pub(crate) fn decode_frame(
        &mut self,
        data: &[u8],
        frame_size: usize,
        output: &mut [f32],
    ) -> Result<(), DecoderError> {
        let packet_stereo = self.channels == Channels::Stereo;
        self.decode_frame_with_packet_stereo(data, frame_size, packet_stereo, output)
    }

    /// Decodes one frame whose coded channel count may differ from the
    /// decoder's output channel count.
    pub(crate) fn decode_frame_with_packet_stereo(
        &mut self,
        data: &[u8],
        frame_size: usize,
        packet_is_stereo: bool,
        output: &mut [f32],
    ) -> Result<(), DecoderError> {
        if data.is_empty() {
            return Err(DecoderError::InvalidFrameData);
        }
        let mut dec = RangeDecoder::new(data);
        self.decode_impl(&mut dec, frame_size, packet_is_stereo, 0, output)
    }

    /// Decodes the CELT part of a hybrid frame. The range decoder has
    /// already been consumed by the speech layer; only bands 17 and up are
    /// coded.
    pub(crate) fn decode_frame_hybrid(
        &mut self,
        range_decoder: Option<&mut RangeDecoder>,
        frame_size: usize,
        output: &mut [f32],
    ) -> Result<(), DecoderError> {
        let dec = range_decoder.ok_or(DecoderError::NilDecoder)?;
        let packet_stereo = self.channels == Channels::Stereo;
        self.decode_impl(dec, frame_size, packet_stereo, 17, output)
    }

    /// Conceals one lost frame.
    ///
    /// The fade-out over consecutive losses is driven by `loss_count`,
    /// which the framing layer tracks.
    pub(crate) fn decode_plc(
        &mut self,
        frame_size: usize,
        loss_count: u32,
        output: &mut [f32],
    ) -> Result<(), DecoderError> {
        let lm = lm_from_frame_size(frame_size).ok_or(DecoderError::InvalidFrameSize)?;
        let channels = if self.channels == Channels::Stereo { 2 } else { 1 };
        let end = self.end_band;

        trace!("plc: frame_size {}, loss {}", frame_size, loss_count);

        // Re-synthesize the last good envelope with noise shapes, fading by
        // 3 dB per consecutive loss.
        let decay = if loss_count == 0 {
            0.0
        } else {
            0.5 * loss_count as f32
        };
        let mut energies = [[SILENCE_FLOOR; MAX_BANDS]; 2];
        (0..channels).for_each(|c| {
            (0..end).for_each(|band| {
                energies[c][band] = f32::max(SILENCE_FLOOR, self.prev_log_e[c][band] - decay);
            });
        });

        let mut rng = self.rng;
        for c in 0..channels {
            let freq = &mut self.freq[c * MAX_FRAME_SIZE..c * MAX_FRAME_SIZE + frame_size];
            freq.iter_mut().for_each(|v| {
                rng = lcg_rand(rng);
                *v = (rng as i32 >> 20) as f32;
            });
            // Unit-norm each band, then scale to the faded envelope.
            (0..end).for_each(|band| {
                let lo = EBANDS[band] << lm;
                let hi = EBANDS[band + 1] << lm;
                let e: f32 = 1e-27 + freq[lo..hi].iter().map(|v| v * v).sum::<f32>();
                let g = 1.0 / e.sqrt();
                freq[lo..hi].iter_mut().for_each(|v| *v *= g);
            });
            denormalise_bands(freq, lm, 0, end, &energies[c]);
        }
        self.rng = rng;

        self.synthesize_and_emit(frame_size, lm, false, channels, output);

        (0..channels).for_each(|c| {
            self.prev_log_e[c][..MAX_BANDS].copy_from_slice(&energies[c]);
        });

        Ok(())
    }

    /// The frame controller: reads every coded element in stream order and
    /// synthesizes the output.
    fn decode_impl(
        &mut self,
        dec: &mut RangeDecoder,
        frame_size: usize,
        packet_is_stereo: bool,
        start: usize,
        output: &mut [f32],
    ) -> Result<(), DecoderError> {
        let lm = lm_from_frame_size(frame_size).ok_or(DecoderError::InvalidFrameSize)?;
        let out_channels = if self.channels == Channels::Stereo { 2 } else { 1 };
        let channels = if packet_is_stereo { 2 } else { 1 };
        let end = usize::max(self.end_band, start + 1);
        // A stereo packet synthesizes two interleaved channels even when the
        // output will be downmixed, so the buffer must cover both layouts.
        if output.len() < frame_size * usize::max(channels, out_channels) {
            return Err(DecoderError::InvalidFrameData);
        }

        // A mono to stereo transition seeds the right channel from the left
        // to avoid a click.
        if packet_is_stereo && !self.prev_packet_stereo {
            self.prev_energy[1] = self.prev_energy[0];
            self.prev_log_e[1] = self.prev_log_e[0];
            self.prev_log_e2[1] = self.prev_log_e2[0];
            let (left, right) = self.decode_mem.split_at_mut(1);
            right[0].copy_from_slice(&left[0]);
            self.preemph_state[1] = self.preemph_state[0];
        }
        self.prev_packet_stereo = packet_is_stereo;

        let total_bits = dec.storage_bits();
        let header = self.read_header(dec, lm, start, total_bits)?;

        if header.silence {
            trace!("silence frame");
            (0..2).for_each(|c| {
                self.prev_energy[c] = [SILENCE_FLOOR; MAX_BANDS];
                self.prev_log_e[c] = [SILENCE_FLOOR; MAX_BANDS];
                self.prev_log_e2[c] = [SILENCE_FLOOR; MAX_BANDS];
            });
            self.freq.iter_mut().for_each(|v| *v = 0.0);
            self.postfilter_gain = 0.0;
            self.postfilter_period = 0;
            self.postfilter_tapset = 0;
            self.finish_frame(frame_size, lm, false, channels, out_channels, output);
            self.rng = lcg_rand(self.rng ^ dec.range());
            return Ok(());
        }

        trace!(
            "frame: lm {}, channels {}, start {}, transient {}, intra {}",
            lm,
            channels,
            start,
            header.transient,
            header.intra
        );

        // Coarse energy.
        let mut energies = self.prev_energy;
        unquant_coarse_energy(
            dec,
            lm,
            start,
            end,
            channels,
            header.intra,
            &mut energies,
            total_bits,
        );

        // Per-band time-frequency resolution.
        let mut tf_res = [0_i8; MAX_BANDS];
        {
            let mut coder = Coder::Dec(&mut *dec);
            tf_code(
                &mut coder,
                start,
                end,
                lm,
                header.transient,
                total_bits,
                &mut tf_res,
                false,
            )
            .map_err(|_| DecoderError::InternalError("tf decode failed"))?;
        }

        // Spread decision.
        let spread = if dec.tell() + 4 <= total_bits {
            Spread::from(dec.decode_icdf(&SPREAD_ICDF, 5))
        } else {
            Spread::Normal
        };

        // Dynamic allocation boosts.
        let mut caps = [0_i32; MAX_BANDS];
        init_caps(&mut caps, lm, channels);
        let mut offsets = [0_i32; MAX_BANDS];
        let mut total_q3 = (total_bits as i32) << 3;
        let mut dynalloc_logp = 6_u32;
        for band in start..end {
            let width = (channels * ((EBANDS[band + 1] - EBANDS[band]) << lm)) as i32;
            // Six bits, but no more than one bit per sample and no less
            // than an eighth of a bit per sample.
            let quanta = i32::min(width << 3, i32::max(6 << 3, width));
            let mut loop_logp = dynalloc_logp;
            let mut boost = 0;
            while (dec.tell_frac() as i32) + ((loop_logp as i32) << 3) < total_q3
                && boost < caps[band]
            {
                if !dec.decode_bit_logp(loop_logp) {
                    break;
                }
                boost += quanta;
                total_q3 -= quanta;
                loop_logp = 1;
            }
            offsets[band] = boost;
            if boost > 0 {
                dynalloc_logp = u32::max(2, dynalloc_logp - 1);
            }
        }

        // Allocation trim.
        let trim = if (dec.tell_frac() as i32) + (6 << 3) <= total_q3 {
            dec.decode_icdf(&TRIM_ICDF, 7) as i32
        } else {
            5
        };

        // Anti-collapse reservation.
        let mut shape_bits = ((total_bits as i32) << 3) - dec.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if header.transient && lm >= 2 && shape_bits >= ((lm as i32) + 2) << 3 {
                1 << 3
            } else {
                0
            };
        shape_bits -= anti_collapse_rsv;

        // The allocator, running exactly as it does in the encoder.
        let alloc = {
            let mut coder = Coder::Dec(&mut *dec);
            compute_allocation(
                &mut coder,
                start,
                end,
                lm,
                channels,
                &offsets,
                &caps,
                trim,
                shape_bits,
                AllocHints::default(),
            )
            .map_err(|_| DecoderError::InternalError("allocation failed"))?
        };

        // Fine energy.
        unquant_fine_energy(dec, start, end, channels, &alloc.fine_quant, &mut energies);

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
            let amps = [[0.0_f32; MAX_BANDS]; 2];
            let mut coder = Coder::Dec(&mut *dec);
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
                header.transient,
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
            )
            .map_err(|_| DecoderError::InternalError("band decode failed"))?;
            self.rng = seed;
        }

        // Anti-collapse flag.
        let anti_collapse_on = anti_collapse_rsv > 0 && dec.decode_bits(1) != 0;

        // Whatever is left refines the energies once more.
        let bits_left = (total_bits as i32) - dec.tell() as i32;
        unquant_energy_finalise(
            dec,
            start,
            end,
            channels,
            &alloc.fine_quant,
            &alloc.fine_priority,
            bits_left,
            &mut energies,
        );

        if anti_collapse_on {
            anti_collapse(
                &mut self.freq,
                channels,
                MAX_FRAME_SIZE,
                &collapse_masks,
                lm,
                start,
                end,
                &energies,
                &self.prev_log_e,
                &self.prev_log_e2,
                &alloc.pulses,
                self.rng,
                channels == 1 && self.channels == Channels::Stereo,
            );
        }

        // Clamp and apply the envelope.
        for c in 0..channels {
            (start..end).for_each(|band| {
                energies[c][band] = energies[c][band].clamp(ENERGY_FLOOR, ENERGY_CEILING);
            });
            denormalise_bands(
                &mut self.freq[c * MAX_FRAME_SIZE..c * MAX_FRAME_SIZE + frame_size],
                lm,
                start,
                end,
                &energies[c],
            );
        }

        // Postfilter parameters advance even when this frame has none.
        self.postfilter_period_old = self.postfilter_period;
        self.postfilter_gain_old = self.postfilter_gain;
        self.postfilter_tapset_old = self.postfilter_tapset;
        self.postfilter_period = header.postfilter_period;
        self.postfilter_gain = header.postfilter_gain;
        self.postfilter_tapset = header.postfilter_tapset;

        self.finish_frame(frame_size, lm, header.transient, channels, out_channels, output);

        // Energy history for the next frame.
        (0..channels).for_each(|c| {
            self.prev_energy[c] = energies[c];
            if header.transient {
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

        // Deterministic reseed for the folding of the next frame.
        self.rng = lcg_rand(self.rng ^ dec.range());

        Ok(())
    }

    /// The folding RNG state, for encoder/decoder lockstep tests.
    #[cfg(test)]
    pub(crate) fn test_rng(&self) -> u32 {
        self.rng
    }

    /// Reads the frame header flags in stream order.
    fn read_header(
        &mut self,
        dec: &mut RangeDecoder,
        lm: usize,
        start: usize,
        total_bits: u32,
    ) -> Result<FrameHeader, DecoderError> {
        let mut header = FrameHeader {
            silence: false,
            postfilter_period: 0,
            postfilter_gain: 0.0,
            postfilter_tapset: 0,
            transient: false,
            intra: false,
        };

        let tell = dec.tell();
        if tell >= total_bits {
            header.silence = true;
        } else if tell == 1 {
            // Only the very first symbol of a frame can be the silence
            // flag; in hybrid mode the speech layer has already consumed
            // bits, so the flag is skipped entirely.
            header.silence = dec.decode_bit_logp(15);
        }
        if header.silence {
            dec.to_end();
            return Ok(header);
        }

        if start == 0 && dec.tell() + 16 <= total_bits {
            let has_postfilter = dec.decode_bit_logp(1);
            if has_postfilter {
                let octave = dec.decode_uint(6);
                let period = (16 << octave) + dec.decode_bits(4 + octave) as usize - 1;
                let gain_q3 = dec.decode_bits(3);
                let gain = 0.09375 * (gain_q3 + 1) as f32;
                let tapset = if dec.tell() + 2 <= total_bits {
                    dec.decode_icdf(&TAPSET_ICDF, 2) as usize
                } else {
                    0
                };
                header.postfilter_period =
                    period.clamp(COMBFILTER_MINPERIOD, COMBFILTER_MAXPERIOD);
                header.postfilter_gain = gain;
                header.postfilter_tapset = if tapset > 2 { 0 } else { tapset };
                trace!(
                    "postfilter: period {}, gain {}, tapset {}",
                    header.postfilter_period,
                    header.postfilter_gain,
                    header.postfilter_tapset
                );
            }
        }

        if lm > 0 && dec.tell() + 3 <= total_bits {
            header.transient = dec.decode_bit_logp(3);
        }
        if dec.tell() + 3 <= total_bits {
            header.intra = dec.decode_bit_logp(3);
        }

        Ok(header)
    }

    /// Synthesizes and emits, fanning coded channels out to the configured
    /// output channel count.
    fn finish_frame(
        &mut self,
        frame_size: usize,
        lm: usize,
        transient: bool,
        coded_channels: usize,
        out_channels: usize,
        output: &mut [f32],
    ) {
        self.synthesize_and_emit(frame_size, lm, transient, coded_channels, output);
        if out_channels == 2 && coded_channels == 1 {
            (0..frame_size).rev().for_each(|i| {
                let v = output[i];
                output[2 * i] = v;
                output[2 * i + 1] = v;
            });
        } else if out_channels == 1 && coded_channels == 2 {
            (0..frame_size).for_each(|i| {
                output[i] = 0.5 * (output[2 * i] + output[2 * i + 1]);
            });
        }
    }

    /// Runs the inverse transform, overlap-add, pitch postfilter and
    /// de-emphasis for every coded channel, emitting interleaved samples.
    fn synthesize_and_emit(
        &mut self,
        frame_size: usize,
        lm: usize,
        transient: bool,
        channels: usize,
        output: &mut [f32],
    ) {
        let blocks = if transient { 1 << lm } else { 1 };
        let block_size = frame_size / blocks;
        debug_assert!(!transient || block_size == SHORT_BLOCK_SIZE);

        let mdct = if transient {
            &mut self.mdcts[0]
        } else {
            &mut self.mdcts[lm]
        };
        let window = &self.mode.window;

        for c in 0..channels {
            let mem = &mut self.decode_mem[c];
            let syn = &mut self.synthesis[..frame_size + OVERLAP];
            let freq_c = &self.freq[c * MAX_FRAME_SIZE..c * MAX_FRAME_SIZE + frame_size];
            let coeffs = &mut self.block_coeffs[..block_size];
            let span = &mut self.block_span[..block_size + OVERLAP];

            // Seed with the previous frame's transform tail.
            syn[..OVERLAP].copy_from_slice(&mem[DECODE_BUFFER_SIZE..]);
            syn[OVERLAP..].iter_mut().for_each(|v| *v = 0.0);

            for b in 0..blocks {
                // De-interleave the short block's coefficients.
                (0..block_size).for_each(|i| {
                    coeffs[i] = freq_c[i * blocks + b];
                });

                mdct.inverse(coeffs, window, span);

                syn[b * block_size..(b + 1) * block_size + OVERLAP]
                    .iter_mut()
                    .zip(span.iter())
                    .for_each(|(s, &v)| *s += v);
            }

            // Slide the history and append the new frame.
            mem.copy_within(frame_size..DECODE_BUFFER_SIZE, 0);
            mem[DECODE_BUFFER_SIZE - frame_size..DECODE_BUFFER_SIZE]
                .copy_from_slice(&syn[..frame_size]);
            mem[DECODE_BUFFER_SIZE..].copy_from_slice(&syn[frame_size..]);

            // Pitch postfilter, crossfading from the previous parameters
            // over the first short block.
            let offset = DECODE_BUFFER_SIZE - frame_size;
            let first = usize::min(SHORT_BLOCK_SIZE, frame_size);
            comb_filter_inplace(
                mem,
                offset,
                self.postfilter_period_old,
                self.postfilter_period,
                first,
                self.postfilter_gain_old,
                self.postfilter_gain,
                self.postfilter_tapset_old,
                self.postfilter_tapset,
                window,
                OVERLAP.min(first),
            );
            if frame_size > first {
                comb_filter_inplace(
                    mem,
                    offset + first,
                    self.postfilter_period,
                    self.postfilter_period,
                    frame_size - first,
                    self.postfilter_gain,
                    self.postfilter_gain,
                    self.postfilter_tapset,
                    self.postfilter_tapset,
                    window,
                    OVERLAP,
                );
            }

            // De-emphasis and output scaling.
            let mut state = self.preemph_state[c];
            (0..frame_size).for_each(|i| {
                let x = mem[offset + i];
                let y = x + PREEMPHASIS * state + VERY_SMALL;
                state = y;
                output[i * channels + c] = y / SIG_SCALE;
            });
            self.preemph_state[c] = state;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::range_coder::RangeEncoder;

    fn new_decoder(channels: Channels) -> CeltDecoder {
        CeltDecoder::new(channels, Bandwidth::Fullband).unwrap()
    }

    /// A frame carrying nothing but the silence flag.
    fn silence_frame() -> Vec<u8> {
        let mut buffer = vec![0_u8; 2];
        let mut enc = RangeEncoder::new(&mut buffer);
        enc.encode_bit_logp(1, 15).unwrap();
        enc.done().unwrap();
        drop(enc);
        buffer
    }

    #[test]
    fn test_invalid_frame_size() {
        let mut dec = new_decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];
        assert!(matches!(
            dec.decode_frame(&[0xFC], 961, &mut out),
            Err(DecoderError::InvalidFrameSize)
        ));
    }

    #[test]
    fn test_empty_data_is_invalid() {
        let mut dec = new_decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];
        assert!(matches!(
            dec.decode_frame(&[], 960, &mut out),
            Err(DecoderError::InvalidFrameData)
        ));
    }

    #[test]
    fn test_hybrid_requires_decoder() {
        let mut dec = new_decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];
        assert!(matches!(
            dec.decode_frame_hybrid(None, 960, &mut out),
            Err(DecoderError::NilDecoder)
        ));
    }

    /// A silence frame must decode to exactly zero output on a fresh
    /// decoder, reset the energy history to the floor and disable the
    /// postfilter.
    #[test]
    fn test_silence_frame() {
        let data = silence_frame();
        let mut dec = new_decoder(Channels::Mono);
        let mut out = vec![1.0_f32; 960];

        dec.decode_frame(&data, 960, &mut out).unwrap();

        out.iter().for_each(|&v| {
            // The de-emphasis filter carries a denormal guard, so "zero"
            // means below any audible or representable 24-bit level.
            assert!(v.abs() < 1e-20);
        });
        (0..MAX_BANDS).for_each(|band| {
            assert_eq!(dec.prev_log_e[0][band], -28.0);
        });
        assert_eq!(dec.postfilter_gain, 0.0);
    }

    /// Arbitrary payloads of every legal size must decode without errors
    /// and leave the energy state inside its clamps.
    #[test]
    fn test_arbitrary_payload_decodes() {
        for &frame_size in &[120_usize, 240, 480, 960] {
            for &fill in &[0x00_u8, 0x5A, 0xFF] {
                let mut dec = new_decoder(Channels::Stereo);
                let data = vec![fill; 60];
                let mut out = vec![0.0_f32; 2 * frame_size];

                dec.decode_frame(&data, frame_size, &mut out).unwrap();

                (0..MAX_BANDS).for_each(|band| {
                    assert!(dec.prev_energy[0][band] >= ENERGY_FLOOR - 1e-5);
                    assert!(dec.prev_energy[0][band] <= ENERGY_CEILING + 1e-5);
                });
                out.iter().for_each(|v| {
                    assert!(v.is_finite());
                });
            }
        }
    }

    /// Two fresh decoders fed the same bytes produce identical output and
    /// identical RNG state.
    #[test]
    fn test_decode_is_deterministic() {
        let data: Vec<u8> = (0..80).map(|i| (i * 37 + 11) as u8).collect();
        let mut out1 = vec![0.0_f32; 960];
        let mut out2 = vec![0.0_f32; 960];

        let mut dec1 = new_decoder(Channels::Mono);
        dec1.decode_frame(&data, 960, &mut out1).unwrap();
        let mut dec2 = new_decoder(Channels::Mono);
        dec2.decode_frame(&data, 960, &mut out2).unwrap();

        assert_eq!(out1, out2);
        assert_eq!(dec1.rng, dec2.rng);
    }

    /// Switching from mono to stereo packets seeds the right channel from
    /// the left, so the first stereo frame starts from coherent state.
    #[test]
    fn test_mono_to_stereo_transition() {
        let mono_packet: Vec<u8> = (0..60).map(|i| (i * 53 + 7) as u8).collect();
        let stereo_packet: Vec<u8> = (0..80).map(|i| (i * 29 + 3) as u8).collect();

        let mut dec = new_decoder(Channels::Stereo);
        let mut out = vec![0.0_f32; 2 * 480];
        dec.decode_frame_with_packet_stereo(&mono_packet, 480, false, &mut out)
            .unwrap();

        let left_energy = dec.prev_energy[0];
        let left_log = dec.prev_log_e[0];
        let left_preemph = dec.preemph_state[0];

        // Force a divergent right-channel state, which the transition must
        // overwrite.
        dec.prev_energy[1] = [9.0; MAX_BANDS];
        dec.prev_log_e[1] = [9.0; MAX_BANDS];
        dec.preemph_state[1] = 123.0;

        // Reference decoder: same history, but with the seeding already in
        // place before the stereo frame.
        let mut reference = new_decoder(Channels::Stereo);
        let mut ref_out = vec![0.0_f32; 2 * 480];
        reference
            .decode_frame_with_packet_stereo(&mono_packet, 480, false, &mut ref_out)
            .unwrap();
        reference.prev_energy[1] = left_energy;
        reference.prev_log_e[1] = left_log;
        reference.prev_log_e2[1] = reference.prev_log_e2[0];
        let (l, r) = reference.decode_mem.split_at_mut(1);
        r[0].copy_from_slice(&l[0]);
        reference.preemph_state[1] = left_preemph;
        reference.prev_packet_stereo = true;

        let mut trans = vec![0.0_f32; 2 * 480];
        dec.decode_frame_with_packet_stereo(&stereo_packet, 480, true, &mut trans)
            .unwrap();
        let mut ref_trans = vec![0.0_f32; 2 * 480];
        reference
            .decode_frame_with_packet_stereo(&stereo_packet, 480, true, &mut ref_trans)
            .unwrap();

        trans.iter().zip(ref_trans.iter()).for_each(|(a, b)| {
            assert!((a - b).abs() < 1e-9, "{} instead of {}", a, b);
        });
    }

    /// Short-block synthesis must place each block's content at the right
    /// time position: with per-block DC levels rising along the frame, the
    /// output amplitude profile must rise in the same order.
    #[test]
    fn test_transient_block_ordering() {
        let frame_size = 960;
        let lm = 3;
        let blocks = 8;
        let block_size = frame_size / blocks;

        let mut levels = [0.0_f32; 8];
        (0..blocks).for_each(|b| {
            levels[b] = (b + 1) as f32;
        });

        let mut dec = new_decoder(Channels::Mono);
        dec.freq[..frame_size].iter_mut().for_each(|v| *v = 0.0);
        // Interleaved layout: coefficient i of block b lives at i*blocks+b.
        (0..blocks).for_each(|b| {
            dec.freq[b] = levels[b] * SIG_SCALE;
        });

        let mut out = vec![0.0_f32; frame_size];
        dec.synthesize_and_emit(frame_size, lm, true, 1, &mut out);

        let mut means = [0.0_f32; 8];
        (0..blocks).for_each(|b| {
            let lo = b * block_size;
            let hi = lo + block_size;
            means[b] = out[lo..hi].iter().map(|v| v.abs()).sum::<f32>() / block_size as f32;
        });

        // Later blocks carry larger DC levels, so the amplitude profile
        // must rise along the frame.
        (1..blocks).for_each(|b| {
            assert!(
                means[b] > means[b - 1] * 0.8,
                "block {} mean {} vs previous {}",
                b,
                means[b],
                means[b - 1]
            );
        });
        assert!(means[7] > 2.0 * means[1], "profile too flat");
    }

    /// Hybrid decoding must leave the bins below band 17 empty.
    #[test]
    fn test_hybrid_decodes_only_high_bands() {
        // Build a payload and consume some of it, as the speech layer
        // would.
        let mut buffer = vec![0_u8; 120];
        let mut enc = RangeEncoder::new(&mut buffer);
        (0..120).for_each(|i| {
            enc.encode_bit_logp((i % 3 == 0) as u32, 1).unwrap();
        });
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        (0..120).for_each(|_| {
            dec.decode_bit_logp(1);
        });
        assert!(dec.tell() >= 120);

        let mut celt = new_decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];
        celt.decode_frame_hybrid(Some(&mut dec), 960, &mut out)
            .unwrap();

        let lm = 3;
        let low_bins = EBANDS[17] << lm;
        celt.freq[..low_bins].iter().for_each(|&v| {
            assert_eq!(v, 0.0, "low bin not empty");
        });
        out.iter().for_each(|v| assert!(v.is_finite()));
    }

    /// Concealment fades out monotonically over consecutive losses.
    #[test]
    fn test_plc_fades_out() {
        let data: Vec<u8> = (0..100).map(|i| (i * 17 + 5) as u8).collect();
        let mut dec = new_decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];
        dec.decode_frame(&data, 960, &mut out).unwrap();

        let mut energies = Vec::new();
        (0..6).for_each(|loss| {
            let mut plc_out = vec![0.0_f32; 960];
            dec.decode_plc(960, loss, &mut plc_out).unwrap();
            let e: f32 = plc_out.iter().map(|v| v * v).sum();
            energies.push(e);
        });

        (2..energies.len()).for_each(|i| {
            assert!(
                energies[i] <= energies[i - 1] * 1.5 + 1e-9,
                "loss {} energy {} grew over {}",
                i,
                energies[i],
                energies[i - 1]
            );
        });
        assert!(energies[5] < energies[1].max(1e-12));
    }
}
