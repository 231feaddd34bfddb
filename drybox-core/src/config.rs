//! Configuration types consumed by the simulation kernel.
//!
//! A `ResolvedScenario` is produced by the scenario loader (outside the
//! kernel), validated there, and treated as immutable here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// PCM sample rate on the AudioBlock boundary.
pub const SAMPLE_RATE_HZ: u32 = 8_000;

/// Samples per audio block (20 ms at 8 kHz).
pub const BLOCK_SAMPLES: usize = 160;

/// Default logical tick length.
pub const DEFAULT_TICK_MS: u64 = 20;

/// Default per-direction `poll_link_tx` budget per tick.
pub const DEFAULT_TX_BUDGET: usize = 32;

/// Default logical window for rolling rates (loss, reorder, jitter,
/// goodput).
pub const DEFAULT_METRICS_WINDOW_MS: u64 = 1_000;

/// Which of the two peers a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn label(self) -> &'static str {
        match self {
            Side::Left => "L",
            Side::Right => "R",
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction of travel through the bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    LtoR,
    RtoL,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::LtoR, Direction::RtoL];

    pub fn source(self) -> Side {
        match self {
            Direction::LtoR => Side::Left,
            Direction::RtoL => Side::Right,
        }
    }

    pub fn dest(self) -> Side {
        self.source().peer()
    }

    /// Capture-record side byte: 0 = L→R, 1 = R→L.
    pub fn wire_code(self) -> u8 {
        match self {
            Direction::LtoR => 0,
            Direction::RtoL => 1,
        }
    }

    pub fn rng_label(self) -> &'static str {
        match self {
            Direction::LtoR => "bearer_LtoR",
            Direction::RtoL => "bearer_RtoL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LtoR => f.write_str("L->R"),
            Direction::RtoL => f.write_str("R->L"),
        }
    }
}

/// Which data path the run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Byte,
    Audio,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Byte => f.write_str("byte"),
            Mode::Audio => f.write_str("audio"),
        }
    }
}

/// Stochastic bearer parameters (one-way).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerParams {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub mtu_bytes: usize,
}

impl Default for BearerParams {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_rate: 0.0,
            reorder_rate: 0.0,
            mtu_bytes: 1_500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    None,
    Awgn,
    Rayleigh,
}

/// Audio channel impairment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParams {
    pub kind: ChannelKind,
    pub snr_db: f64,
    pub doppler_hz: f64,
    pub num_paths: usize,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            kind: ChannelKind::None,
            snr_db: 30.0,
            doppler_hz: 0.0,
            num_paths: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VocoderKind {
    #[default]
    None,
    Amr12k2Mock,
    Evs13k2Mock,
    OpusNbMock,
}

/// Vocoder mock parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocoderParams {
    pub kind: VocoderKind,
    pub vad_dtx: bool,
    /// Probability that a frame is marked lost at the audio level.
    pub loss_rate: f64,
}

impl Default for VocoderParams {
    fn default() -> Self {
        Self {
            kind: VocoderKind::None,
            vad_dtx: false,
            loss_rate: 0.0,
        }
    }
}

/// Per-side endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideParams {
    /// Adapter spec, `name[:Class]`.
    pub adapter: String,
    /// Linear gain applied to this side's transmitted audio.
    pub gain: f64,
    /// Adapter-private modem settings, carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modem: Option<serde_json::Value>,
}

impl Default for SideParams {
    fn default() -> Self {
        Self {
            adapter: "silence".to_string(),
            gain: 1.0,
            modem: None,
        }
    }
}

/// Optional explicit key material, as written in the scenario.
///
/// Each entry is hex, base64, or `@path` to a file containing either;
/// parsing happens in [`crate::keys`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_priv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_priv: Option<String>,
}

impl CryptoParams {
    pub fn for_side(&self, side: Side) -> Option<&str> {
        match side {
            Side::Left => self.left_priv.as_deref(),
            Side::Right => self.right_priv.as_deref(),
        }
    }
}

/// One post-run acceptance expectation on the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventExpectation {
    #[serde(rename = "type")]
    pub event_type: String,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_t_ms: Option<u64>,
}

/// The immutable, fully-resolved run configuration the kernel consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedScenario {
    pub mode: Mode,
    pub duration_ms: u64,
    pub tick_ms: u64,
    pub seed: u64,
    pub bearer: BearerParams,
    pub channel: ChannelParams,
    pub vocoder: VocoderParams,
    pub left: SideParams,
    pub right: SideParams,
    #[serde(default)]
    pub crypto: CryptoParams,
    #[serde(default)]
    pub acceptance: Vec<EventExpectation>,
    #[serde(default = "default_tx_budget")]
    pub tx_budget: usize,
    #[serde(default = "default_metrics_window_ms")]
    pub metrics_window_ms: u64,
}

fn default_tx_budget() -> usize {
    DEFAULT_TX_BUDGET
}

fn default_metrics_window_ms() -> u64 {
    DEFAULT_METRICS_WINDOW_MS
}

impl Default for ResolvedScenario {
    fn default() -> Self {
        Self {
            mode: Mode::Byte,
            duration_ms: 1_000,
            tick_ms: DEFAULT_TICK_MS,
            seed: 0,
            bearer: BearerParams::default(),
            channel: ChannelParams::default(),
            vocoder: VocoderParams::default(),
            left: SideParams::default(),
            right: SideParams::default(),
            crypto: CryptoParams::default(),
            acceptance: Vec::new(),
            tx_budget: DEFAULT_TX_BUDGET,
            metrics_window_ms: DEFAULT_METRICS_WINDOW_MS,
        }
    }
}

impl ResolvedScenario {
    pub fn side(&self, side: Side) -> &SideParams {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Bearer round-trip estimate used to expire reassembly groups,
    /// floored at one tick so zero-latency bearers still get a window.
    pub fn rtt_est_ms(&self) -> f64 {
        (2.0 * self.bearer.latency_ms).max(self.tick_ms as f64)
    }
}
