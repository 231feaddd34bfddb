//! Vocoder mocks: block-level fidelity degradation, VAD/DTX, and
//! audio-level loss marking.
//!
//! A mock is not a codec; it imitates one at the block level by smoothing
//! and re-quantizing samples to shave fidelity roughly the way the real
//! codec's nominal bitrate would. The contract kept by every kind: the
//! identity kind preserves block energy exactly, and no mock loses more
//! than 3 dB of block energy at nominal SNR.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::channel::mean_square;
use crate::config::{VocoderKind, VocoderParams};

/// VAD hysteresis thresholds on mean sample power, and the hangover length
/// in frames before DTX engages.
const VAD_ENTER_POWER: f64 = 100.0;
const VAD_EXIT_POWER: f64 = 200.0;
const VAD_HANGOVER_FRAMES: u32 = 5;

/// Comfort noise amplitude emitted for DTX frames.
const COMFORT_NOISE_AMPLITUDE: i16 = 2;

/// Flags attached to one processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Frame marked lost at the audio level; concealed downstream, never
    /// propagated past PLC.
    pub lost: bool,
    /// Frame carried as DTX/comfort noise.
    pub dtx: bool,
}

struct MockShape {
    quant_bits: u32,
    /// One-pole smoothing coefficient; 0 disables the low-pass.
    smoothing: f64,
}

/// Numeric parameters of one mock kind, recorded into
/// `scenario.resolved.yaml` so runs document the shapes they used.
#[derive(Debug, Clone, Serialize)]
pub struct MockShapeInfo {
    pub kind: VocoderKind,
    pub quant_bits: u32,
    pub smoothing: f64,
}

pub fn mock_shapes() -> Vec<MockShapeInfo> {
    [
        VocoderKind::Amr12k2Mock,
        VocoderKind::Evs13k2Mock,
        VocoderKind::OpusNbMock,
    ]
    .into_iter()
    .filter_map(|kind| {
        shape_for(kind).map(|shape| MockShapeInfo {
            kind,
            quant_bits: shape.quant_bits,
            smoothing: shape.smoothing,
        })
    })
    .collect()
}

fn shape_for(kind: VocoderKind) -> Option<MockShape> {
    match kind {
        VocoderKind::None => None,
        VocoderKind::Amr12k2Mock => Some(MockShape {
            quant_bits: 6,
            smoothing: 0.4,
        }),
        VocoderKind::Evs13k2Mock => Some(MockShape {
            quant_bits: 7,
            smoothing: 0.25,
        }),
        VocoderKind::OpusNbMock => Some(MockShape {
            quant_bits: 7,
            smoothing: 0.35,
        }),
    }
}

/// One side's encode/decode mock; state persists across frames.
pub struct Vocoder {
    params: VocoderParams,
    rng: ChaCha8Rng,
    frame_count: u64,
    lp_state: f64,
    vad_active: bool,
    vad_hangover: u32,
}

impl Vocoder {
    pub fn new(params: VocoderParams, rng: ChaCha8Rng) -> Self {
        Self {
            params,
            rng,
            frame_count: 0,
            lp_state: 0.0,
            vad_active: true,
            vad_hangover: VAD_HANGOVER_FRAMES,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one block through the mock in place.
    pub fn encode_decode(&mut self, block: &mut [i16], _t_ms: u64) -> FrameFlags {
        self.frame_count += 1;
        let input_power = mean_square(block);

        let dtx = self.params.vad_dtx && self.update_vad(input_power);
        if dtx {
            for sample in block.iter_mut() {
                *sample = self
                    .rng
                    .gen_range(-COMFORT_NOISE_AMPLITUDE..=COMFORT_NOISE_AMPLITUDE);
            }
        } else if let Some(shape) = shape_for(self.params.kind) {
            self.degrade(block, &shape);
        }

        // The loss draw happens every frame so the stream position depends
        // only on the frame count, not on the loss configuration.
        let loss_draw: f64 = self.rng.gen();
        FrameFlags {
            lost: loss_draw < self.params.loss_rate,
            dtx,
        }
    }

    /// Energy hysteresis with hangover; returns true while in DTX.
    fn update_vad(&mut self, input_power: f64) -> bool {
        if input_power > VAD_EXIT_POWER {
            self.vad_active = true;
            self.vad_hangover = VAD_HANGOVER_FRAMES;
        } else if input_power < VAD_ENTER_POWER {
            if self.vad_hangover > 0 {
                self.vad_hangover -= 1;
            } else {
                self.vad_active = false;
            }
        }
        !self.vad_active
    }

    fn degrade(&mut self, block: &mut [i16], shape: &MockShape) {
        let a = shape.smoothing;
        let shift = 16 - shape.quant_bits;
        for sample in block.iter_mut() {
            self.lp_state = (1.0 - a) * f64::from(*sample) + a * self.lp_state;
            let smoothed = self.lp_state.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX));
            *sample = ((smoothed as i16) >> shift) << shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_SAMPLES;
    use rand::SeedableRng;
    use std::f64::consts::TAU;

    fn vocoder(kind: VocoderKind, vad_dtx: bool, loss_rate: f64) -> Vocoder {
        Vocoder::new(
            VocoderParams {
                kind,
                vad_dtx,
                loss_rate,
            },
            ChaCha8Rng::seed_from_u64(7),
        )
    }

    fn sine_block(amplitude: f64) -> Vec<i16> {
        (0..BLOCK_SAMPLES)
            .map(|n| (amplitude * (TAU * n as f64 / 8.0).sin()).round() as i16)
            .collect()
    }

    #[test]
    fn identity_kind_preserves_samples() {
        let mut voc = vocoder(VocoderKind::None, false, 0.0);
        let clean = sine_block(12_000.0);
        let mut block = clean.clone();
        let flags = voc.encode_decode(&mut block, 0);
        assert_eq!(block, clean);
        assert_eq!(flags, FrameFlags::default());
    }

    #[test]
    fn identity_on_silence_is_all_zero() {
        let mut voc = vocoder(VocoderKind::None, false, 0.0);
        let mut block = vec![0i16; BLOCK_SAMPLES];
        voc.encode_decode(&mut block, 0);
        assert!(block.iter().all(|&s| s == 0));
    }

    #[test]
    fn mocks_lose_at_most_3db_of_energy() {
        for kind in [
            VocoderKind::Amr12k2Mock,
            VocoderKind::Evs13k2Mock,
            VocoderKind::OpusNbMock,
        ] {
            let mut voc = vocoder(kind, false, 0.0);
            let clean = sine_block(12_000.0);
            let clean_power = mean_square(&clean);
            // Skip the first block while the one-pole state settles.
            let mut block = clean.clone();
            voc.encode_decode(&mut block, 0);
            let mut block = clean.clone();
            voc.encode_decode(&mut block, 20);

            let degraded_power = mean_square(&block);
            let loss_db = 10.0 * (clean_power / degraded_power).log10();
            assert!(
                loss_db <= 3.0,
                "{kind:?} lost {loss_db:.2} dB of block energy"
            );
            assert!(block != clean, "{kind:?} should alter the block");
        }
    }

    #[test]
    fn loss_rate_one_marks_every_frame() {
        let mut voc = vocoder(VocoderKind::None, false, 1.0);
        for _ in 0..20 {
            let mut block = sine_block(1_000.0);
            assert!(voc.encode_decode(&mut block, 0).lost);
        }
    }

    #[test]
    fn loss_rate_zero_marks_nothing() {
        let mut voc = vocoder(VocoderKind::Amr12k2Mock, false, 0.0);
        for _ in 0..20 {
            let mut block = sine_block(1_000.0);
            assert!(!voc.encode_decode(&mut block, 0).lost);
        }
    }

    #[test]
    fn dtx_engages_after_hangover_and_releases_on_speech() {
        let mut voc = vocoder(VocoderKind::Amr12k2Mock, true, 0.0);

        // Loud frames keep VAD active.
        let mut block = sine_block(12_000.0);
        assert!(!voc.encode_decode(&mut block, 0).dtx);

        // Quiet frames: hangover counts down before DTX engages.
        let mut dtx_seen_at = None;
        for frame in 0..10 {
            let mut quiet = vec![0i16; BLOCK_SAMPLES];
            if voc.encode_decode(&mut quiet, 0).dtx {
                assert!(quiet
                    .iter()
                    .all(|&s| s.abs() <= COMFORT_NOISE_AMPLITUDE));
                dtx_seen_at = Some(frame);
                break;
            }
        }
        assert_eq!(dtx_seen_at, Some(VAD_HANGOVER_FRAMES as usize));

        // Speech releases DTX immediately.
        let mut block = sine_block(12_000.0);
        assert!(!voc.encode_decode(&mut block, 0).dtx);
    }
}
