//! Channel modeling and impairment simulation for the audio path.
//!
//! Two impairments are modeled: AWGN sized to a configured SNR, and a
//! Jakes-style Rayleigh fading process (sum of complex sinusoids advancing
//! with the Doppler frequency each tick) followed by the same AWGN. Fading
//! oscillator state persists across ticks, per direction.

use num_complex::Complex64;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::f64::consts::TAU;

use crate::config::{ChannelKind, ChannelParams, Direction};

/// Per-block observations reported back to the metrics layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelReport {
    /// Realized SNR from delivered signal and added noise powers.
    pub snr_db_est: Option<f64>,
    /// Instantaneous fading gain, in dB.
    pub fade_gain_db: Option<f64>,
}

#[derive(Debug)]
struct FadingState {
    phases: Vec<f64>,
    /// Per-path phase advance per tick, `2π · f_d · cos(aoa) · tick_s`.
    steps: Vec<f64>,
}

impl FadingState {
    fn new(num_paths: usize, doppler_hz: f64, tick_ms: u64, rng: &mut ChaCha8Rng) -> Self {
        let paths = num_paths.max(1);
        let tick_s = tick_ms as f64 / 1_000.0;
        let mut phases = Vec::with_capacity(paths);
        let mut steps = Vec::with_capacity(paths);
        for n in 0..paths {
            // Angles of arrival evenly distributed around the circle;
            // initial phases pseudo-random.
            let aoa = TAU * (n as f64 + 0.5) / paths as f64;
            phases.push(rng.gen_range(0.0..TAU));
            steps.push(TAU * doppler_hz * aoa.cos() * tick_s);
        }
        Self { phases, steps }
    }

    /// Advance one tick and return the instantaneous complex gain.
    fn advance(&mut self) -> Complex64 {
        let mut h = Complex64::new(0.0, 0.0);
        for (phase, step) in self.phases.iter_mut().zip(&self.steps) {
            *phase = (*phase + step) % TAU;
            h += Complex64::new(0.0, *phase).exp();
        }
        h / (self.phases.len() as f64).sqrt()
    }
}

/// Stateful channel shared by both audio directions.
#[derive(Debug)]
pub struct Channel {
    kind: ChannelKind,
    snr_db: f64,
    noise_rng: ChaCha8Rng,
    fading: Option<[FadingState; 2]>,
}

impl Channel {
    pub fn new(
        params: &ChannelParams,
        tick_ms: u64,
        noise_rng: ChaCha8Rng,
        mut fading_rng: ChaCha8Rng,
    ) -> Self {
        let fading = match params.kind {
            ChannelKind::Rayleigh => Some([
                FadingState::new(params.num_paths, params.doppler_hz, tick_ms, &mut fading_rng),
                FadingState::new(params.num_paths, params.doppler_hz, tick_ms, &mut fading_rng),
            ]),
            _ => None,
        };
        Self {
            kind: params.kind,
            snr_db: params.snr_db,
            noise_rng,
            fading,
        }
    }

    /// Impair one block in place and report what was done to it.
    pub fn apply(&mut self, direction: Direction, block: &mut [i16]) -> ChannelReport {
        match self.kind {
            ChannelKind::None => ChannelReport::default(),
            ChannelKind::Awgn => ChannelReport {
                snr_db_est: self.add_noise(block),
                fade_gain_db: None,
            },
            ChannelKind::Rayleigh => {
                let state = &mut self
                    .fading
                    .as_mut()
                    .unwrap_or_else(|| unreachable!("fading state for rayleigh"))
                    [direction.wire_code() as usize];
                let gain = state.advance().norm();
                for sample in block.iter_mut() {
                    *sample = clip(f64::from(*sample) * gain);
                }
                ChannelReport {
                    snr_db_est: self.add_noise(block),
                    fade_gain_db: Some(20.0 * gain.max(f64::MIN_POSITIVE).log10()),
                }
            }
        }
    }

    /// Add white Gaussian noise sized to the configured SNR; returns the
    /// realized SNR estimate, or `None` when nothing was added.
    fn add_noise(&mut self, block: &mut [i16]) -> Option<f64> {
        if self.snr_db.is_infinite() && self.snr_db > 0.0 {
            return None;
        }
        let signal_power = mean_square(block);
        if signal_power == 0.0 {
            return None;
        }
        let noise_power = signal_power / 10f64.powf(self.snr_db / 10.0);
        let noise_std = noise_power.sqrt();

        let mut added_power = 0.0;
        for sample in block.iter_mut() {
            let noise: f64 = self.noise_rng.sample::<f64, _>(StandardNormal) * noise_std;
            added_power += noise * noise;
            *sample = clip(f64::from(*sample) + noise);
        }
        added_power /= block.len().max(1) as f64;
        if added_power == 0.0 {
            return None;
        }
        Some(10.0 * (signal_power / added_power).log10())
    }
}

pub(crate) fn clip(value: f64) -> i16 {
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Mean sample power with an at-least-one-sample floor in the denominator.
pub fn mean_square(block: &[i16]) -> f64 {
    let sum: f64 = block.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    sum / block.len().max(1) as f64
}
