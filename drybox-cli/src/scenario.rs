//! Scenario file loading and validation.
//!
//! The YAML schema is validated here, at the boundary; the kernel only ever
//! sees a fully-resolved, range-checked [`ResolvedScenario`]. Any schema
//! violation maps to exit code 4.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::path::Path;

use drybox_core::config::{
    BearerParams, ChannelKind, ChannelParams, CryptoParams, EventExpectation, Mode,
    ResolvedScenario, SideParams, VocoderKind, VocoderParams, DEFAULT_TICK_MS,
};
use drybox_core::errors::ScenarioError;
use drybox_core::sar::HEADER_LEN;

/// CLI-level overrides applied on top of the scenario file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub seed: Option<u64>,
    pub tick_ms: Option<u64>,
    pub left_adapter: Option<String>,
    pub right_adapter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    mode: String,
    duration_ms: u64,
    #[serde(default)]
    seed: u64,
    #[serde(default = "default_tick_ms")]
    tick_ms: u64,
    #[serde(default)]
    network: NetworkSection,
    #[serde(default)]
    channel: ChannelSection,
    #[serde(default)]
    vocoder: VocoderSection,
    left: SideSection,
    right: SideSection,
    #[serde(default)]
    crypto: CryptoSection,
    #[serde(default)]
    acceptance: Option<AcceptanceSection>,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkSection {
    #[serde(default = "default_bearer_kind")]
    bearer: String,
    #[serde(default)]
    latency_ms: f64,
    #[serde(default)]
    jitter_ms: f64,
    #[serde(default)]
    loss_rate: f64,
    #[serde(default)]
    reorder_rate: f64,
    #[serde(default = "default_mtu")]
    mtu: usize,
}

fn default_bearer_kind() -> String {
    "basic".to_string()
}

fn default_mtu() -> usize {
    1_500
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bearer: default_bearer_kind(),
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_rate: 0.0,
            reorder_rate: 0.0,
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelSection {
    #[serde(rename = "type", default = "default_channel_type")]
    kind: String,
    #[serde(default = "default_snr_db")]
    snr_db: f64,
    #[serde(default)]
    doppler_hz: f64,
    #[serde(default = "default_num_paths")]
    num_paths: usize,
}

fn default_channel_type() -> String {
    "none".to_string()
}

fn default_snr_db() -> f64 {
    30.0
}

fn default_num_paths() -> usize {
    8
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            kind: default_channel_type(),
            snr_db: default_snr_db(),
            doppler_hz: 0.0,
            num_paths: default_num_paths(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VocoderSection {
    #[serde(rename = "type", default = "default_vocoder_type")]
    kind: String,
    #[serde(default)]
    vad_dtx: bool,
    #[serde(default)]
    loss_rate: f64,
}

fn default_vocoder_type() -> String {
    "none".to_string()
}

impl Default for VocoderSection {
    fn default() -> Self {
        Self {
            kind: default_vocoder_type(),
            vad_dtx: false,
            loss_rate: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SideSection {
    adapter: String,
    #[serde(default = "default_gain")]
    gain: f64,
    #[serde(default)]
    modem: Option<JsonValue>,
}

fn default_gain() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CryptoSection {
    #[serde(default)]
    left_priv: Option<String>,
    #[serde(default)]
    right_priv: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AcceptanceSection {
    min_events: Vec<EventExpectation>,
}

impl ScenarioFile {
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScenarioError::InvalidField {
            field: "scenario",
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_yaml::from_str(&text).map_err(|e| ScenarioError::InvalidField {
            field: "scenario",
            reason: e.to_string(),
        })
    }

    /// Validate the schema and produce the immutable kernel configuration.
    pub fn resolve(self, overrides: &Overrides) -> Result<ResolvedScenario, ScenarioError> {
        let mode = match self.mode.as_str() {
            "byte" => Mode::Byte,
            "audio" => Mode::Audio,
            other => {
                return Err(ScenarioError::UnknownKind {
                    what: "mode",
                    value: other.to_string(),
                })
            }
        };

        if self.network.bearer != "basic" {
            return Err(ScenarioError::UnknownKind {
                what: "bearer",
                value: self.network.bearer,
            });
        }
        let channel_kind = match self.channel.kind.as_str() {
            "none" => ChannelKind::None,
            "awgn" => ChannelKind::Awgn,
            "rayleigh" => ChannelKind::Rayleigh,
            other => {
                return Err(ScenarioError::UnknownKind {
                    what: "channel",
                    value: other.to_string(),
                })
            }
        };
        let vocoder_kind = match self.vocoder.kind.as_str() {
            "none" => VocoderKind::None,
            "amr12k2_mock" => VocoderKind::Amr12k2Mock,
            "evs13k2_mock" => VocoderKind::Evs13k2Mock,
            "opus_nb_mock" => VocoderKind::OpusNbMock,
            other => {
                return Err(ScenarioError::UnknownKind {
                    what: "vocoder",
                    value: other.to_string(),
                })
            }
        };

        let duration_ms = self.duration_ms;
        let tick_ms = overrides.tick_ms.unwrap_or(self.tick_ms);
        check(duration_ms > 0, "duration_ms", "must be positive")?;
        check(tick_ms > 0, "tick_ms", "must be positive")?;
        check(
            self.network.latency_ms >= 0.0,
            "network.latency_ms",
            "must be non-negative",
        )?;
        check(
            self.network.jitter_ms >= 0.0,
            "network.jitter_ms",
            "must be non-negative",
        )?;
        check_rate(self.network.loss_rate, "network.loss_rate")?;
        check_rate(self.network.reorder_rate, "network.reorder_rate")?;
        check(
            self.network.mtu > HEADER_LEN,
            "network.mtu",
            "must exceed the 3-byte fragment header",
        )?;
        check(
            self.channel.num_paths >= 1,
            "channel.num_paths",
            "must be at least 1",
        )?;
        check(
            self.channel.doppler_hz >= 0.0,
            "channel.doppler_hz",
            "must be non-negative",
        )?;
        check_rate(self.vocoder.loss_rate, "vocoder.loss_rate")?;
        check(self.left.gain >= 0.0, "left.gain", "must be non-negative")?;
        check(self.right.gain >= 0.0, "right.gain", "must be non-negative")?;

        Ok(ResolvedScenario {
            mode,
            duration_ms,
            tick_ms,
            seed: overrides.seed.unwrap_or(self.seed),
            bearer: BearerParams {
                latency_ms: self.network.latency_ms,
                jitter_ms: self.network.jitter_ms,
                loss_rate: self.network.loss_rate,
                reorder_rate: self.network.reorder_rate,
                mtu_bytes: self.network.mtu,
            },
            channel: ChannelParams {
                kind: channel_kind,
                snr_db: self.channel.snr_db,
                doppler_hz: self.channel.doppler_hz,
                num_paths: self.channel.num_paths,
            },
            vocoder: VocoderParams {
                kind: vocoder_kind,
                vad_dtx: self.vocoder.vad_dtx,
                loss_rate: self.vocoder.loss_rate,
            },
            left: SideParams {
                adapter: overrides
                    .left_adapter
                    .clone()
                    .unwrap_or(self.left.adapter),
                gain: self.left.gain,
                modem: self.left.modem,
            },
            right: SideParams {
                adapter: overrides
                    .right_adapter
                    .clone()
                    .unwrap_or(self.right.adapter),
                gain: self.right.gain,
                modem: self.right.modem,
            },
            crypto: CryptoParams {
                left_priv: self.crypto.left_priv,
                right_priv: self.crypto.right_priv,
            },
            acceptance: self
                .acceptance
                .map(|a| a.min_events)
                .unwrap_or_default(),
            tx_budget: drybox_core::config::DEFAULT_TX_BUDGET,
            metrics_window_ms: drybox_core::config::DEFAULT_METRICS_WINDOW_MS,
        })
    }
}

fn check(ok: bool, field: &'static str, reason: &str) -> Result<(), ScenarioError> {
    if ok {
        Ok(())
    } else {
        Err(ScenarioError::InvalidField {
            field,
            reason: reason.to_string(),
        })
    }
}

fn check_rate(value: f64, field: &'static str) -> Result<(), ScenarioError> {
    check(
        (0.0..=1.0).contains(&value),
        field,
        "must be within [0, 1]",
    )
}
