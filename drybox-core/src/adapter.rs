//! Adapter ABI: the contract either peer must satisfy, plus the checked
//! host wrapper the runner drives.
//!
//! Adapters are in-process trait objects. The trait is the ABI; a
//! dynamic-library or subprocess loader could be substituted without
//! changing the kernel, since everything downstream sees only the
//! normalized shapes the host produces.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::{Mode, ResolvedScenario, Side, BLOCK_SAMPLES, SAMPLE_RATE_HZ};
use crate::errors::{EndpointError, Result, ScenarioError};
use crate::keys::CryptoMaterial;

/// ABI version spoken by this kernel.
pub const ABI_VERSION: &str = "1.0";

/// One 20 ms block of mono PCM: exactly [`BLOCK_SAMPLES`] `i16` samples.
pub type AudioBlock = Vec<i16>;

/// A zero-filled block. Silence is always represented, never absent.
pub fn silence_block() -> AudioBlock {
    vec![0; BLOCK_SAMPLES]
}

/// PCM parameters on the AudioBlock boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub block_samples: usize,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE_HZ,
            block_samples: BLOCK_SAMPLES,
        }
    }
}

/// What an adapter advertises before the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub abi_version: String,
    pub bytelink: bool,
    pub audioblock: bool,
    pub sdu_max_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_params: Option<AudioParams>,
}

impl Capabilities {
    pub fn bytelink(sdu_max_bytes: usize) -> Self {
        Self {
            abi_version: ABI_VERSION.to_string(),
            bytelink: true,
            audioblock: false,
            sdu_max_bytes,
            audio_params: None,
        }
    }

    pub fn audioblock() -> Self {
        Self {
            abi_version: ABI_VERSION.to_string(),
            bytelink: false,
            audioblock: true,
            sdu_max_bytes: 0,
            audio_params: Some(AudioParams::default()),
        }
    }

    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::Byte => self.bytelink,
            Mode::Audio => self.audioblock,
        }
    }
}

/// Error an adapter may return from any callback. Always fatal to the run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AdapterError(pub String);

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// An SDU handed up by `poll_link_tx`, either bare bytes or bytes tagged
/// with the logical time they were produced. Normalized by the host; the
/// bearer never sees the distinction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxSdu {
    Bytes(Vec<u8>),
    Timed(Vec<u8>, u64),
}

impl TxSdu {
    fn into_parts(self, default_t_ms: u64) -> (Vec<u8>, u64) {
        match self {
            TxSdu::Bytes(bytes) => (bytes, default_t_ms),
            TxSdu::Timed(bytes, t_ms) => (bytes, t_ms),
        }
    }
}

impl From<Vec<u8>> for TxSdu {
    fn from(bytes: Vec<u8>) -> Self {
        TxSdu::Bytes(bytes)
    }
}

/// An event queued by an adapter, drained by the runner into the JSONL log.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_type: String,
    pub payload: JsonValue,
}

/// Per-side context handed to every adapter callback.
///
/// The kernel owns the artifact files; adapters only get a write-only event
/// queue that the runner drains after each callback.
pub struct AdapterContext {
    pub side: Side,
    pub tick_ms: u64,
    pub seed: u64,
    pub out_dir: PathBuf,
    pub rng: ChaCha8Rng,
    pub crypto: Option<CryptoMaterial>,
    now_ms: u64,
    pending_events: Vec<PendingEvent>,
}

impl AdapterContext {
    pub fn new(
        side: Side,
        scenario: &ResolvedScenario,
        out_dir: PathBuf,
        rng: ChaCha8Rng,
        crypto: Option<CryptoMaterial>,
    ) -> Self {
        Self {
            side,
            tick_ms: scenario.tick_ms,
            seed: scenario.seed,
            out_dir,
            rng,
            crypto,
            now_ms: 0,
            pending_events: Vec::new(),
        }
    }

    /// Current logical time.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Queue an event for the run's JSONL log.
    pub fn emit_event(&mut self, event_type: impl Into<String>, payload: JsonValue) {
        self.pending_events.push(PendingEvent {
            event_type: event_type.into(),
            payload,
        });
    }

    pub(crate) fn set_now(&mut self, t_ms: u64) {
        self.now_ms = t_ms;
    }

    pub(crate) fn drain_events(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

/// The contract required of any peer under test.
///
/// `on_timer` fires every tick; the link callbacks apply in byte mode, the
/// block callbacks in audio mode. Both audio callbacks carry `t_ms`.
pub trait Adapter {
    fn capabilities(&self) -> Capabilities;

    fn init(&mut self, _scenario: &ResolvedScenario) -> AdapterResult<()> {
        Ok(())
    }

    fn start(&mut self, _ctx: &mut AdapterContext) -> AdapterResult<()> {
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut AdapterContext) -> AdapterResult<()> {
        Ok(())
    }

    fn on_timer(&mut self, _ctx: &mut AdapterContext, _t_ms: u64) -> AdapterResult<()> {
        Ok(())
    }

    /// ByteLink: SDUs to transmit this tick, at most `budget` of them.
    fn poll_link_tx(&mut self, _ctx: &mut AdapterContext, _budget: usize) -> AdapterResult<Vec<TxSdu>> {
        Ok(Vec::new())
    }

    /// ByteLink: a reassembled SDU arrived from the peer.
    fn on_link_rx(&mut self, _ctx: &mut AdapterContext, _sdu: &[u8]) -> AdapterResult<()> {
        Ok(())
    }

    /// AudioBlock: produce exactly one block for this tick.
    fn pull_tx_block(&mut self, _ctx: &mut AdapterContext, _t_ms: u64) -> AdapterResult<AudioBlock> {
        Ok(silence_block())
    }

    /// AudioBlock: a block arrived from the peer.
    fn push_rx_block(
        &mut self,
        _ctx: &mut AdapterContext,
        _pcm: &[i16],
        _t_ms: u64,
    ) -> AdapterResult<()> {
        Ok(())
    }
}

/// Check that both peers advertise the scenario's mode; returns the sides
/// whose audio parameters diverge from the kernel defaults (the kernel
/// keeps its own, the divergence is recorded as an event).
pub fn negotiate(
    mode: Mode,
    left: &Capabilities,
    right: &Capabilities,
) -> Result<Vec<(Side, AudioParams)>> {
    if !left.supports(mode) || !right.supports(mode) {
        return Err(ScenarioError::ModeUnsupported {
            mode: mode.to_string(),
            left: left.supports(mode),
            right: right.supports(mode),
        }
        .into());
    }

    let mut overridden = Vec::new();
    if mode == Mode::Audio {
        for (side, caps) in [(Side::Left, left), (Side::Right, right)] {
            if let Some(params) = caps.audio_params {
                if params != AudioParams::default() {
                    overridden.push((side, params));
                }
            }
        }
    }
    Ok(overridden)
}

/// Checked wrapper around one adapter: catches panics, validates shapes,
/// and normalizes return values before the kernel sees them.
pub struct AdapterHost {
    side: Side,
    adapter: Box<dyn Adapter>,
    caps: Capabilities,
    pub ctx: AdapterContext,
}

impl AdapterHost {
    pub fn new(adapter: Box<dyn Adapter>, ctx: AdapterContext) -> Self {
        let caps = adapter.capabilities();
        Self {
            side: ctx.side,
            adapter,
            caps,
            ctx,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn drain_events(&mut self) -> Vec<PendingEvent> {
        self.ctx.drain_events()
    }

    pub fn set_now(&mut self, t_ms: u64) {
        self.ctx.set_now(t_ms);
    }

    fn guard<T>(
        &mut self,
        callback: &'static str,
        f: impl FnOnce(&mut dyn Adapter, &mut AdapterContext) -> AdapterResult<T>,
    ) -> Result<T> {
        let side = self.side;
        let adapter = self.adapter.as_mut();
        let ctx = &mut self.ctx;
        match catch_unwind(AssertUnwindSafe(|| f(adapter, ctx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(EndpointError::CallbackFailed {
                side,
                callback,
                reason: error.to_string(),
            }
            .into()),
            Err(_) => Err(EndpointError::CallbackPanicked { side, callback }.into()),
        }
    }

    pub fn init(&mut self, scenario: &ResolvedScenario) -> Result<()> {
        self.guard("init", |adapter, _| adapter.init(scenario))
    }

    pub fn start(&mut self) -> Result<()> {
        self.guard("start", |adapter, ctx| adapter.start(ctx))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.guard("stop", |adapter, ctx| adapter.stop(ctx))
    }

    pub fn on_timer(&mut self, t_ms: u64) -> Result<()> {
        self.guard("on_timer", |adapter, ctx| adapter.on_timer(ctx, t_ms))
    }

    /// Poll for TX SDUs and normalize them; an SDU above the adapter's own
    /// declared `sdu_max_bytes` is a fatal endpoint error.
    pub fn poll_link_tx(&mut self, budget: usize, t_ms: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        let sdus = self.guard("poll_link_tx", |adapter, ctx| {
            adapter.poll_link_tx(ctx, budget)
        })?;
        let max = self.caps.sdu_max_bytes;
        sdus.into_iter()
            .take(budget)
            .map(|sdu| {
                let (bytes, sdu_t_ms) = sdu.into_parts(t_ms);
                if bytes.len() > max {
                    Err(EndpointError::OversizeSdu {
                        side: self.side,
                        len: bytes.len(),
                        max,
                    }
                    .into())
                } else {
                    Ok((bytes, sdu_t_ms))
                }
            })
            .collect()
    }

    pub fn on_link_rx(&mut self, sdu: &[u8]) -> Result<()> {
        self.guard("on_link_rx", |adapter, ctx| adapter.on_link_rx(ctx, sdu))
    }

    /// Pull one block and enforce the PCM shape contract.
    pub fn pull_tx_block(&mut self, t_ms: u64) -> Result<AudioBlock> {
        let block = self.guard("pull_tx_block", |adapter, ctx| {
            adapter.pull_tx_block(ctx, t_ms)
        })?;
        if block.len() != BLOCK_SAMPLES {
            return Err(EndpointError::BadBlockLength {
                side: self.side,
                expected: BLOCK_SAMPLES,
                actual: block.len(),
            }
            .into());
        }
        Ok(block)
    }

    pub fn push_rx_block(&mut self, pcm: &[i16], t_ms: u64) -> Result<()> {
        self.guard("push_rx_block", |adapter, ctx| {
            adapter.push_rx_block(ctx, pcm, t_ms)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct Misbehaver {
        oversize: bool,
        short_block: bool,
        panic_on_timer: bool,
    }

    impl Adapter for Misbehaver {
        fn capabilities(&self) -> Capabilities {
            let mut caps = Capabilities::bytelink(8);
            caps.audioblock = true;
            caps
        }

        fn on_timer(&mut self, _ctx: &mut AdapterContext, _t_ms: u64) -> AdapterResult<()> {
            if self.panic_on_timer {
                panic!("boom");
            }
            Ok(())
        }

        fn poll_link_tx(
            &mut self,
            _ctx: &mut AdapterContext,
            _budget: usize,
        ) -> AdapterResult<Vec<TxSdu>> {
            if self.oversize {
                Ok(vec![TxSdu::Bytes(vec![0; 64])])
            } else {
                Ok(vec![
                    TxSdu::Bytes(b"ab".to_vec()),
                    TxSdu::Timed(b"cd".to_vec(), 7),
                ])
            }
        }

        fn pull_tx_block(
            &mut self,
            _ctx: &mut AdapterContext,
            _t_ms: u64,
        ) -> AdapterResult<AudioBlock> {
            if self.short_block {
                Ok(vec![0; 80])
            } else {
                Ok(silence_block())
            }
        }
    }

    fn host(adapter: Misbehaver) -> AdapterHost {
        let scenario = ResolvedScenario::default();
        let ctx = AdapterContext::new(
            Side::Left,
            &scenario,
            PathBuf::from("out"),
            ChaCha8Rng::seed_from_u64(0),
            None,
        );
        AdapterHost::new(Box::new(adapter), ctx)
    }

    #[test]
    fn tx_shapes_are_normalized() {
        let mut host = host(Misbehaver {
            oversize: false,
            short_block: false,
            panic_on_timer: false,
        });
        let sdus = host.poll_link_tx(32, 100).unwrap();
        assert_eq!(sdus, vec![(b"ab".to_vec(), 100), (b"cd".to_vec(), 7)]);
    }

    #[test]
    fn oversize_sdu_is_fatal() {
        let mut host = host(Misbehaver {
            oversize: true,
            short_block: false,
            panic_on_timer: false,
        });
        let err = host.poll_link_tx(32, 0).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn short_block_is_fatal() {
        let mut host = host(Misbehaver {
            oversize: false,
            short_block: true,
            panic_on_timer: false,
        });
        let err = host.pull_tx_block(0).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn panics_become_endpoint_errors() {
        let mut host = host(Misbehaver {
            oversize: false,
            short_block: false,
            panic_on_timer: true,
        });
        let err = host.on_timer(0).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn negotiation_rejects_unsupported_mode() {
        let byte_only = Capabilities::bytelink(1_024);
        let audio_only = Capabilities::audioblock();
        assert!(negotiate(Mode::Byte, &byte_only, &byte_only).is_ok());
        let err = negotiate(Mode::Audio, &byte_only, &audio_only).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn negotiation_reports_divergent_audio_params() {
        let mut odd = Capabilities::audioblock();
        odd.audio_params = Some(AudioParams {
            sample_rate: 16_000,
            block_samples: 320,
        });
        let standard = Capabilities::audioblock();
        let overridden = negotiate(Mode::Audio, &odd, &standard).unwrap();
        assert_eq!(overridden.len(), 1);
        assert_eq!(overridden[0].0, Side::Left);
    }

    #[test]
    fn context_events_are_drained_once() {
        let scenario = ResolvedScenario::default();
        let mut ctx = AdapterContext::new(
            Side::Right,
            &scenario,
            PathBuf::from("out"),
            ChaCha8Rng::seed_from_u64(0),
            None,
        );
        ctx.emit_event("handshake", serde_json::json!({"ok": true}));
        assert_eq!(ctx.drain_events().len(), 1);
        assert!(ctx.drain_events().is_empty());
    }
}
