//! The discrete-event runner: advances the logical clock and orchestrates
//! adapter callbacks, the ByteLink and AudioBlock paths, and artifact
//! emission.
//!
//! Per-tick order is fixed: left timer, right timer, mode-specific I/O
//! (L→R enqueued before R→L), metrics row, capture flush. The runner never
//! sleeps; `t_ms` is the only notion of time. Fatal errors terminate the
//! loop immediately but still close every artifact.

use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::Path;

use crate::adapter::{negotiate, Adapter, AdapterContext, AdapterHost};
use crate::bearer::{Bearer, BearerVerdict};
use crate::capture::{CaptureEvent, CaptureLayer, CaptureRecord, CaptureWriter};
use crate::channel::{self, Channel};
use crate::config::{Direction, Mode, ResolvedScenario, Side};
use crate::errors::{
    AcceptanceError, ArtifactError, DryboxError, EndpointError, Result, ScenarioError,
};
use crate::keys;
use crate::metrics::{EventLog, LinkWindow, MetricsRow, MetricsWriter};
use crate::plc::Plc;
use crate::rng::RngTree;
use crate::sar::{Reassembler, SarError, SarOutcome, Segmenter};
use crate::vocoder::{self, Vocoder};

/// Aggregate counters reported after a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub sdus_delivered: u64,
    pub pdus_delivered: u64,
    pub pdus_dropped: u64,
    pub blocks_processed: u64,
    pub frames_concealed: u64,
}

struct LinkPath {
    direction: Direction,
    segmenter: Segmenter,
    bearer: Bearer,
    reassembler: Reassembler,
    window: LinkWindow,
}

impl LinkPath {
    fn new(direction: Direction, scenario: &ResolvedScenario, rng_tree: &RngTree) -> Self {
        Self {
            direction,
            segmenter: Segmenter::new(),
            bearer: Bearer::new(scenario.bearer.clone(), rng_tree.bearer(direction)),
            reassembler: Reassembler::new(scenario.rtt_est_ms()),
            window: LinkWindow::new(scenario.metrics_window_ms),
        }
    }
}

struct AudioPath {
    direction: Direction,
    vocoder: Vocoder,
    plc: Plc,
    last_snr_db_est: Option<f64>,
}

impl AudioPath {
    fn new(direction: Direction, scenario: &ResolvedScenario, rng_tree: &RngTree) -> Self {
        Self {
            direction,
            vocoder: Vocoder::new(scenario.vocoder.clone(), rng_tree.vocoder(direction.source())),
            plc: Plc::new(scenario.tick_ms),
            last_snr_db_est: None,
        }
    }
}

enum PathState {
    Byte(Box<[LinkPath; 2]>),
    Audio {
        channel: Channel,
        paths: Box<[AudioPath; 2]>,
    },
}

struct Runner<'a> {
    scenario: &'a ResolvedScenario,
    left: AdapterHost,
    right: AdapterHost,
    paths: PathState,
    metrics: MetricsWriter,
    events: EventLog,
    capture: CaptureWriter,
    summary: RunSummary,
}

/// Execute one scenario to completion.
///
/// Artifacts land in `out_dir`; the returned summary is informational. Map
/// errors to process exit codes with [`DryboxError::exit_code`].
pub fn run(
    scenario: &ResolvedScenario,
    left: Box<dyn Adapter>,
    right: Box<dyn Adapter>,
    out_dir: &Path,
) -> Result<RunSummary> {
    fs::create_dir_all(out_dir).map_err(|source| ArtifactError::Write {
        artifact: "out_dir",
        source,
    })?;
    write_resolved_scenario(scenario, out_dir)?;

    let (left_keys, right_keys) = keys::provision(scenario)?;
    keys::write_pubkeys(out_dir, &left_keys, &right_keys)?;

    let rng_tree = RngTree::new(scenario.seed);
    let left_ctx = AdapterContext::new(
        Side::Left,
        scenario,
        out_dir.to_path_buf(),
        rng_tree.adapter(Side::Left),
        Some(left_keys),
    );
    let right_ctx = AdapterContext::new(
        Side::Right,
        scenario,
        out_dir.to_path_buf(),
        rng_tree.adapter(Side::Right),
        Some(right_keys),
    );

    let mut runner = Runner::new(
        scenario,
        AdapterHost::new(left, left_ctx),
        AdapterHost::new(right, right_ctx),
        &rng_tree,
        out_dir,
    )?;

    let outcome = runner.drive();
    if let Err(error) = &outcome {
        // Record the failure before closing; a sink error here must not
        // mask the original fault.
        let _ = runner.events.append(
            runner.summary.ticks * scenario.tick_ms,
            None,
            "run_aborted",
            &json!({ "error": error.to_string() }),
        );
    }
    let closed = runner.close();

    let summary = outcome?;
    closed?;
    runner.check_acceptance()?;
    Ok(summary)
}

fn write_resolved_scenario(scenario: &ResolvedScenario, out_dir: &Path) -> Result<()> {
    #[derive(Serialize)]
    struct ResolvedDump<'a> {
        #[serde(flatten)]
        scenario: &'a ResolvedScenario,
        vocoder_mock_params: Vec<vocoder::MockShapeInfo>,
    }

    let dump = ResolvedDump {
        scenario,
        vocoder_mock_params: vocoder::mock_shapes(),
    };
    let text = serde_yaml::to_string(&dump).map_err(|e| ArtifactError::Serialize {
        artifact: "scenario.resolved.yaml",
        reason: e.to_string(),
    })?;
    fs::write(out_dir.join("scenario.resolved.yaml"), text).map_err(|source| {
        ArtifactError::Write {
            artifact: "scenario.resolved.yaml",
            source,
        }
        .into()
    })
}

impl<'a> Runner<'a> {
    fn new(
        scenario: &'a ResolvedScenario,
        left: AdapterHost,
        right: AdapterHost,
        rng_tree: &RngTree,
        out_dir: &Path,
    ) -> Result<Self> {
        let paths = match scenario.mode {
            Mode::Byte => PathState::Byte(Box::new([
                LinkPath::new(Direction::LtoR, scenario, rng_tree),
                LinkPath::new(Direction::RtoL, scenario, rng_tree),
            ])),
            Mode::Audio => PathState::Audio {
                channel: Channel::new(
                    &scenario.channel,
                    scenario.tick_ms,
                    rng_tree.awgn(),
                    rng_tree.fading(),
                ),
                paths: Box::new([
                    AudioPath::new(Direction::LtoR, scenario, rng_tree),
                    AudioPath::new(Direction::RtoL, scenario, rng_tree),
                ]),
            },
        };

        Ok(Self {
            scenario,
            left,
            right,
            paths,
            metrics: MetricsWriter::create(out_dir)?,
            events: EventLog::create(out_dir)?,
            capture: CaptureWriter::create(out_dir)?,
            summary: RunSummary::default(),
        })
    }

    fn drive(&mut self) -> Result<RunSummary> {
        let overridden = negotiate(
            self.scenario.mode,
            self.left.capabilities(),
            self.right.capabilities(),
        )?;
        for (side, params) in overridden {
            self.events.append(
                0,
                Some(side),
                "audioparams_override",
                &json!({
                    "requested": params,
                    "used": crate::adapter::AudioParams::default(),
                }),
            )?;
        }

        self.events.append(
            0,
            None,
            "run_start",
            &json!({
                "mode": self.scenario.mode.to_string(),
                "duration_ms": self.scenario.duration_ms,
                "tick_ms": self.scenario.tick_ms,
                "seed": self.scenario.seed,
            }),
        )?;

        self.left.init(self.scenario)?;
        self.right.init(self.scenario)?;
        self.left.start()?;
        self.right.start()?;
        self.drain_adapter_events(0)?;

        let tick_ms = self.scenario.tick_ms;
        let ticks = self.scenario.duration_ms / tick_ms;
        for tick in 0..ticks {
            let t_ms = tick * tick_ms;
            self.left.set_now(t_ms);
            self.right.set_now(t_ms);

            self.left.on_timer(t_ms)?;
            self.drain_side_events(Side::Left, t_ms)?;
            self.right.on_timer(t_ms)?;
            self.drain_side_events(Side::Right, t_ms)?;

            match self.scenario.mode {
                Mode::Byte => self.byte_tick(t_ms)?,
                Mode::Audio => self.audio_tick(t_ms)?,
            }

            self.emit_metrics(t_ms)?;
            self.capture.flush_tick()?;
            self.summary.ticks += 1;
        }

        let end_t_ms = ticks.saturating_sub(1) * tick_ms;
        self.left.stop()?;
        self.right.stop()?;
        self.drain_adapter_events(end_t_ms)?;
        self.events
            .append(end_t_ms, None, "run_end", &json!(&self.summary))?;
        Ok(self.summary.clone())
    }

    fn drain_adapter_events(&mut self, t_ms: u64) -> Result<()> {
        self.drain_side_events(Side::Left, t_ms)?;
        self.drain_side_events(Side::Right, t_ms)
    }

    fn drain_side_events(&mut self, side: Side, t_ms: u64) -> Result<()> {
        let host = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        for event in host.drain_events() {
            self.events
                .append(t_ms, Some(side), &event.event_type, &event.payload)?;
        }
        Ok(())
    }

    /// One ByteLink tick. Both directions enqueue (L→R first) before either
    /// delivers, so an SDU echoed in response to a delivery is polled on the
    /// following tick, never within the same one.
    fn byte_tick(&mut self, t_ms: u64) -> Result<()> {
        // Stale reassembly groups go first so a group never survives past
        // its deadline just because traffic kept arriving.
        for index in 0..2 {
            let direction = Direction::BOTH[index];
            let purged = match &mut self.paths {
                PathState::Byte(links) => links[index].reassembler.purge_stale(t_ms),
                PathState::Audio { .. } => unreachable!("byte tick in audio mode"),
            };
            for frag_id in purged {
                self.events.append(
                    t_ms,
                    Some(direction.dest()),
                    "sar_timeout",
                    &json!({ "frag_id": frag_id, "direction": direction.to_string() }),
                )?;
            }
        }
        for index in 0..2 {
            self.transmit(Direction::BOTH[index], index, t_ms)?;
        }
        for index in 0..2 {
            self.deliver(Direction::BOTH[index], index, t_ms)?;
        }
        Ok(())
    }

    fn transmit(&mut self, direction: Direction, index: usize, t_ms: u64) -> Result<()> {
        let budget = self.scenario.tx_budget;
        let source = match direction.source() {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        let sdus = source.poll_link_tx(budget, t_ms)?;
        self.drain_side_events(direction.source(), t_ms)?;

        let link = match &mut self.paths {
            PathState::Byte(links) => &mut links[index],
            PathState::Audio { .. } => unreachable!("byte tick in audio mode"),
        };
        let mtu = link.bearer.mtu_bytes();

        for (sdu, _sdu_t_ms) in sdus {
            let pdus = link.segmenter.segment(&sdu, mtu).map_err(|e| match e {
                SarError::OversizeSdu { len, mtu } => DryboxError::from(
                    EndpointError::UnfragmentableSdu {
                        side: direction.source(),
                        len,
                        mtu,
                    },
                ),
                other => DryboxError::from(ScenarioError::InvalidField {
                    field: "network.mtu",
                    reason: other.to_string(),
                }),
            })?;

            for pdu in pdus {
                self.capture.append(CaptureRecord {
                    t_ms,
                    direction,
                    layer: CaptureLayer::ByteLink,
                    event: CaptureEvent::Tx,
                    data: pdu.clone(),
                });
                match link.bearer.enqueue(pdu, t_ms) {
                    BearerVerdict::Enqueued { .. } => link.window.record_enqueued(t_ms),
                    BearerVerdict::Dropped(payload) => {
                        link.window.record_drop(t_ms);
                        self.summary.pdus_dropped += 1;
                        self.capture.append(CaptureRecord {
                            t_ms,
                            direction,
                            layer: CaptureLayer::Bearer,
                            event: CaptureEvent::Drop,
                            data: payload,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, direction: Direction, index: usize, t_ms: u64) -> Result<()> {
        let link = match &mut self.paths {
            PathState::Byte(links) => &mut links[index],
            PathState::Audio { .. } => unreachable!("byte tick in audio mode"),
        };

        let mut completed = Vec::new();
        let mut inconsistent = Vec::new();
        for pdu in link.bearer.drain_due(t_ms) {
            let delay_ms = pdu.one_way_delay_ms();
            link.window.record_delivery(t_ms, delay_ms, pdu.reordered);
            link.reassembler.observe_delay(delay_ms);
            self.summary.pdus_delivered += 1;
            self.capture.append(CaptureRecord {
                t_ms,
                direction,
                layer: CaptureLayer::Bearer,
                event: CaptureEvent::Rx,
                data: pdu.payload.clone(),
            });

            match link.reassembler.accept(&pdu.payload, t_ms) {
                Ok(SarOutcome::Complete(sdu)) => {
                    link.window.record_sdu(t_ms, sdu.len());
                    completed.push(sdu);
                }
                Ok(SarOutcome::Pending) => {}
                Ok(SarOutcome::Inconsistent { frag_id }) => inconsistent.push(json!({
                    "frag_id": frag_id,
                    "direction": direction.to_string(),
                })),
                Err(e) => inconsistent.push(json!({
                    "direction": direction.to_string(),
                    "reason": e.to_string(),
                })),
            }
        }

        for payload in inconsistent {
            self.events
                .append(t_ms, Some(direction.dest()), "sar_inconsistent", &payload)?;
        }
        for sdu in completed {
            let dest = match direction.dest() {
                Side::Left => &mut self.left,
                Side::Right => &mut self.right,
            };
            dest.on_link_rx(&sdu)?;
            self.summary.sdus_delivered += 1;
            self.drain_side_events(direction.dest(), t_ms)?;
        }
        Ok(())
    }

    /// One AudioBlock tick: pull, gain, channel, vocoder, PLC, push.
    fn audio_tick(&mut self, t_ms: u64) -> Result<()> {
        for index in 0..2 {
            let direction = Direction::BOTH[index];
            let gain = self.scenario.side(direction.source()).gain;

            let source = match direction.source() {
                Side::Left => &mut self.left,
                Side::Right => &mut self.right,
            };
            let mut block = source.pull_tx_block(t_ms)?;
            self.drain_side_events(direction.source(), t_ms)?;

            if gain != 1.0 {
                for sample in block.iter_mut() {
                    *sample = channel::clip(f64::from(*sample) * gain);
                }
            }

            let (channel, path) = match &mut self.paths {
                PathState::Audio { channel, paths } => (channel, &mut paths[index]),
                PathState::Byte(_) => unreachable!("audio tick in byte mode"),
            };

            let report = channel.apply(direction, &mut block);
            path.last_snr_db_est = report.snr_db_est;

            let flags = path.vocoder.encode_decode(&mut block, t_ms);
            path.plc.conceal(&mut block, flags.lost);
            if flags.lost {
                self.summary.frames_concealed += 1;
            }
            self.summary.blocks_processed += 1;

            let dest = match direction.dest() {
                Side::Left => &mut self.left,
                Side::Right => &mut self.right,
            };
            dest.push_rx_block(&block, t_ms)?;
            self.drain_side_events(direction.dest(), t_ms)?;
        }
        Ok(())
    }

    /// Emit one row per direction slice that saw activity this window.
    fn emit_metrics(&mut self, t_ms: u64) -> Result<()> {
        match &mut self.paths {
            PathState::Byte(links) => {
                for link in links.iter_mut() {
                    link.window.prune(t_ms);
                    if link.window.is_empty() {
                        continue;
                    }
                    let mut row =
                        MetricsRow::new(t_ms, link.direction.source(), "bytelink", "tick");
                    row.rtt_ms_est = Some(link.reassembler.rtt_est_ms());
                    row.latency_ms = link.window.mean_delay_ms();
                    row.jitter_ms = link.window.jitter_ms();
                    row.loss_rate = link.window.loss_rate();
                    row.reorder_rate = link.window.reorder_rate();
                    row.per = link.window.loss_rate();
                    row.goodput_bps = link.window.goodput_bps();
                    self.metrics.write_row(&row)?;
                }
            }
            PathState::Audio { paths, .. } => {
                for path in paths.iter_mut() {
                    let mut row = MetricsRow::new(t_ms, path.direction.source(), "audio", "tick");
                    row.snr_db_est = path.last_snr_db_est;
                    self.metrics.write_row(&row)?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.metrics.finish()?;
        self.events.finish()?;
        self.capture.finish()
    }

    fn check_acceptance(&self) -> Result<()> {
        for expectation in &self.scenario.acceptance {
            let observed = self
                .events
                .count(&expectation.event_type, expectation.by_t_ms);
            if observed < expectation.count {
                return Err(AcceptanceError::MissingEvents {
                    event_type: expectation.event_type.clone(),
                    expected: expectation.count,
                    observed,
                    by_t_ms: expectation.by_t_ms,
                }
                .into());
            }
        }
        Ok(())
    }
}
