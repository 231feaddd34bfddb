//! Built-in reference adapters and the registry that resolves adapter
//! specs.
//!
//! An adapter spec is `name[:Class]`; the class defaults to `Adapter`. The
//! registry is the in-process stand-in for a dynamic loader: the kernel
//! only ever sees `Box<dyn Adapter>`, so a library- or subprocess-backed
//! loader could be slotted in here without touching anything else.

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::f64::consts::TAU;

use drybox_core::adapter::{
    silence_block, Adapter, AdapterContext, AdapterResult, AudioBlock, Capabilities, TxSdu,
};
use drybox_core::config::{ResolvedScenario, Side, BLOCK_SAMPLES};
use drybox_core::errors::ScenarioError;

const PING_INTERVAL_MS: u64 = 500;
const DEFAULT_SDU_MAX_BYTES: usize = 4_096;

/// Resolve an adapter spec against the built-in registry.
pub fn build(
    scenario: &ResolvedScenario,
    side: Side,
) -> Result<Box<dyn Adapter>, ScenarioError> {
    let spec = &scenario.side(side).adapter;
    let (name, class) = match spec.split_once(':') {
        Some((name, class)) => (name, class),
        None => (spec.as_str(), "Adapter"),
    };
    if class != "Adapter" {
        return Err(ScenarioError::UnknownAdapter { spec: spec.clone() });
    }

    let modem = scenario.side(side).modem.clone();
    match name {
        "ping" => Ok(Box::new(PingAdapter::default())),
        "pong" => Ok(Box::new(PongAdapter::default())),
        "blast" => Ok(Box::new(BlastAdapter::configure(modem)?)),
        "tone" => Ok(Box::new(ToneAdapter::configure(modem)?)),
        "silence" => Ok(Box::new(SilenceAdapter)),
        _ => Err(ScenarioError::UnknownAdapter { spec: spec.clone() }),
    }
}

/// ByteLink source: sends `PING` on a fixed period and raises a `pong`
/// event for each echo that makes it back.
#[derive(Default)]
struct PingAdapter {
    outbox: Vec<Vec<u8>>,
    pings_sent: u64,
    pongs_seen: u64,
}

impl Adapter for PingAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::bytelink(DEFAULT_SDU_MAX_BYTES)
    }

    fn on_timer(&mut self, _ctx: &mut AdapterContext, t_ms: u64) -> AdapterResult<()> {
        if t_ms > 0 && t_ms % PING_INTERVAL_MS == 0 {
            self.outbox.push(b"PING".to_vec());
            self.pings_sent += 1;
        }
        Ok(())
    }

    fn poll_link_tx(&mut self, _ctx: &mut AdapterContext, _budget: usize) -> AdapterResult<Vec<TxSdu>> {
        Ok(self.outbox.drain(..).map(TxSdu::Bytes).collect())
    }

    fn on_link_rx(&mut self, ctx: &mut AdapterContext, sdu: &[u8]) -> AdapterResult<()> {
        if sdu == b"PONG" {
            self.pongs_seen += 1;
            ctx.emit_event("pong", json!({ "count": self.pongs_seen }));
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut AdapterContext) -> AdapterResult<()> {
        ctx.emit_event(
            "ping_report",
            json!({ "sent": self.pings_sent, "echoed": self.pongs_seen }),
        );
        Ok(())
    }
}

/// ByteLink echo: answers every received SDU with `PONG`.
#[derive(Default)]
struct PongAdapter {
    outbox: Vec<Vec<u8>>,
}

impl Adapter for PongAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::bytelink(DEFAULT_SDU_MAX_BYTES)
    }

    fn poll_link_tx(&mut self, _ctx: &mut AdapterContext, _budget: usize) -> AdapterResult<Vec<TxSdu>> {
        Ok(self.outbox.drain(..).map(TxSdu::Bytes).collect())
    }

    fn on_link_rx(&mut self, _ctx: &mut AdapterContext, _sdu: &[u8]) -> AdapterResult<()> {
        self.outbox.push(b"PONG".to_vec());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlastConfig {
    #[serde(default = "default_blast_bytes")]
    sdu_bytes: usize,
    #[serde(default = "default_blast_period")]
    period_ms: u64,
}

fn default_blast_bytes() -> usize {
    256
}

fn default_blast_period() -> u64 {
    100
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            sdu_bytes: default_blast_bytes(),
            period_ms: default_blast_period(),
        }
    }
}

/// ByteLink source: periodic SDUs of pseudo-random bytes drawn from the
/// side's own RNG stream.
struct BlastAdapter {
    config: BlastConfig,
    outbox: Vec<Vec<u8>>,
    received: u64,
}

impl BlastAdapter {
    fn configure(modem: Option<serde_json::Value>) -> Result<Self, ScenarioError> {
        let config = parse_modem(modem, "blast")?;
        Ok(Self {
            config,
            outbox: Vec::new(),
            received: 0,
        })
    }
}

impl Adapter for BlastAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::bytelink(self.config.sdu_bytes.max(DEFAULT_SDU_MAX_BYTES))
    }

    fn on_timer(&mut self, ctx: &mut AdapterContext, t_ms: u64) -> AdapterResult<()> {
        if t_ms % self.config.period_ms == 0 {
            let sdu = (0..self.config.sdu_bytes)
                .map(|_| ctx.rng.gen())
                .collect::<Vec<u8>>();
            self.outbox.push(sdu);
        }
        Ok(())
    }

    fn poll_link_tx(&mut self, _ctx: &mut AdapterContext, _budget: usize) -> AdapterResult<Vec<TxSdu>> {
        Ok(self.outbox.drain(..).map(TxSdu::Bytes).collect())
    }

    fn on_link_rx(&mut self, _ctx: &mut AdapterContext, _sdu: &[u8]) -> AdapterResult<()> {
        self.received += 1;
        Ok(())
    }

    fn stop(&mut self, ctx: &mut AdapterContext) -> AdapterResult<()> {
        ctx.emit_event("blast_report", json!({ "received": self.received }));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToneConfig {
    #[serde(default = "default_tone_freq")]
    freq_hz: f64,
    #[serde(default = "default_tone_amplitude")]
    amplitude: f64,
}

fn default_tone_freq() -> f64 {
    1_000.0
}

fn default_tone_amplitude() -> f64 {
    16_000.0
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            freq_hz: default_tone_freq(),
            amplitude: default_tone_amplitude(),
        }
    }
}

/// AudioBlock source/sink: a phase-continuous sine generator that tracks
/// received power and reports it when the run stops.
struct ToneAdapter {
    config: ToneConfig,
    phase: f64,
    rx_blocks: u64,
    rx_power_sum: f64,
}

impl ToneAdapter {
    fn configure(modem: Option<serde_json::Value>) -> Result<Self, ScenarioError> {
        let config = parse_modem(modem, "tone")?;
        Ok(Self {
            config,
            phase: 0.0,
            rx_blocks: 0,
            rx_power_sum: 0.0,
        })
    }
}

impl Adapter for ToneAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::audioblock()
    }

    fn pull_tx_block(&mut self, _ctx: &mut AdapterContext, _t_ms: u64) -> AdapterResult<AudioBlock> {
        let step = TAU * self.config.freq_hz / 8_000.0;
        let block = (0..BLOCK_SAMPLES)
            .map(|n| {
                (self.config.amplitude * (self.phase + step * n as f64).sin()).round() as i16
            })
            .collect();
        self.phase = (self.phase + step * BLOCK_SAMPLES as f64) % TAU;
        Ok(block)
    }

    fn push_rx_block(
        &mut self,
        _ctx: &mut AdapterContext,
        pcm: &[i16],
        _t_ms: u64,
    ) -> AdapterResult<()> {
        let power: f64 = pcm.iter().map(|&s| f64::from(s) * f64::from(s)).sum::<f64>()
            / pcm.len().max(1) as f64;
        self.rx_blocks += 1;
        self.rx_power_sum += power;
        Ok(())
    }

    fn stop(&mut self, ctx: &mut AdapterContext) -> AdapterResult<()> {
        let mean_power = if self.rx_blocks > 0 {
            self.rx_power_sum / self.rx_blocks as f64
        } else {
            0.0
        };
        ctx.emit_event(
            "audio_rx_report",
            json!({ "blocks": self.rx_blocks, "mean_power": mean_power }),
        );
        Ok(())
    }
}

/// AudioBlock no-op: transmits silence, discards everything received.
struct SilenceAdapter;

impl Adapter for SilenceAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::audioblock()
    }

    fn pull_tx_block(&mut self, _ctx: &mut AdapterContext, _t_ms: u64) -> AdapterResult<AudioBlock> {
        Ok(silence_block())
    }
}

fn parse_modem<T>(modem: Option<serde_json::Value>, adapter: &str) -> Result<T, ScenarioError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match modem {
        None => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| ScenarioError::InvalidField {
                field: "modem",
                reason: format!("{adapter}: {e}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_with_adapters(left: &str, right: &str) -> ResolvedScenario {
        let mut scenario = ResolvedScenario::default();
        scenario.left.adapter = left.to_string();
        scenario.right.adapter = right.to_string();
        scenario
    }

    #[test]
    fn registry_resolves_known_names() {
        let scenario = scenario_with_adapters("ping", "pong");
        assert!(build(&scenario, Side::Left).is_ok());
        assert!(build(&scenario, Side::Right).is_ok());
    }

    #[test]
    fn explicit_default_class_is_accepted() {
        let scenario = scenario_with_adapters("tone:Adapter", "silence");
        assert!(build(&scenario, Side::Left).is_ok());
    }

    #[test]
    fn unknown_name_or_class_is_rejected() {
        let scenario = scenario_with_adapters("warble", "pong:EchoServer");
        assert!(matches!(
            build(&scenario, Side::Left),
            Err(ScenarioError::UnknownAdapter { .. })
        ));
        assert!(matches!(
            build(&scenario, Side::Right),
            Err(ScenarioError::UnknownAdapter { .. })
        ));
    }

    #[test]
    fn modem_settings_reach_the_adapter() {
        let mut scenario = scenario_with_adapters("blast", "silence");
        scenario.left.modem = Some(json!({ "sdu_bytes": 32, "period_ms": 40 }));
        build(&scenario, Side::Left).unwrap();

        let adapter = BlastAdapter::configure(scenario.left.modem.clone()).unwrap();
        assert_eq!(adapter.config.sdu_bytes, 32);
        assert_eq!(adapter.config.period_ms, 40);
    }

    #[test]
    fn malformed_modem_is_a_scenario_error() {
        let mut scenario = scenario_with_adapters("tone", "silence");
        scenario.left.modem = Some(json!({ "pitch": "high" }));
        assert!(build(&scenario, Side::Left).is_err());
    }

    #[test]
    fn tone_blocks_have_the_contract_shape() {
        let mut adapter = ToneAdapter::configure(None).unwrap();
        let scenario = ResolvedScenario::default();
        let mut ctx = test_ctx(&scenario);
        let block = adapter.pull_tx_block(&mut ctx, 0).unwrap();
        assert_eq!(block.len(), BLOCK_SAMPLES);
        assert!(block.iter().any(|&s| s != 0));
    }

    fn test_ctx(scenario: &ResolvedScenario) -> AdapterContext {
        use rand::SeedableRng;
        AdapterContext::new(
            Side::Left,
            scenario,
            std::path::PathBuf::from("out"),
            rand_chacha::ChaCha8Rng::seed_from_u64(0),
            None,
        )
    }
}
