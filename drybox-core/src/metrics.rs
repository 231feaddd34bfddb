//! Metrics rows, rolling link statistics, and the CSV/JSONL sinks.
//!
//! The runner is the only writer. Rolling rates (loss, reorder, jitter,
//! goodput) are computed over a 1 s window of logical time, per direction.
//! Cells the kernel did not observe stay blank in the CSV.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::{Side, DEFAULT_METRICS_WINDOW_MS};
use crate::errors::{ArtifactError, Result};

/// Fixed column set of `metrics.csv`.
pub const CSV_HEADER: &str = "t_ms,side,layer,event,rtt_ms_est,latency_ms,jitter_ms,loss_rate,\
reorder_rate,goodput_bps,snr_db_est,ber,per,cfo_hz_est,lock_ratio,hs_time_ms,rekey_ms,aead_fail_cnt";

/// One per-tick observation row. Unset cells serialize as empty.
#[derive(Debug, Clone, Default)]
pub struct MetricsRow {
    pub t_ms: u64,
    pub side: &'static str,
    pub layer: &'static str,
    pub event: &'static str,
    pub rtt_ms_est: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_rate: Option<f64>,
    pub reorder_rate: Option<f64>,
    pub goodput_bps: Option<f64>,
    pub snr_db_est: Option<f64>,
    pub ber: Option<f64>,
    pub per: Option<f64>,
    pub cfo_hz_est: Option<f64>,
    pub lock_ratio: Option<f64>,
    pub hs_time_ms: Option<f64>,
    pub rekey_ms: Option<f64>,
    pub aead_fail_cnt: Option<u64>,
}

impl MetricsRow {
    pub fn new(t_ms: u64, side: Side, layer: &'static str, event: &'static str) -> Self {
        Self {
            t_ms,
            side: side.label(),
            layer,
            event,
            ..Self::default()
        }
    }

    fn to_csv_line(&self) -> String {
        let mut line = String::with_capacity(96);
        let _ = write!(line, "{},{},{},{}", self.t_ms, self.side, self.layer, self.event);
        for cell in [
            self.rtt_ms_est,
            self.latency_ms,
            self.jitter_ms,
            self.loss_rate,
            self.reorder_rate,
            self.goodput_bps,
            self.snr_db_est,
            self.ber,
            self.per,
            self.cfo_hz_est,
            self.lock_ratio,
            self.hs_time_ms,
            self.rekey_ms,
        ] {
            match cell {
                Some(value) => {
                    let _ = write!(line, ",{value:.3}");
                }
                None => line.push(','),
            }
        }
        match self.aead_fail_cnt {
            Some(count) => {
                let _ = write!(line, ",{count}");
            }
            None => line.push(','),
        }
        line
    }
}

/// `metrics.csv` sink; header is written on creation.
pub struct MetricsWriter {
    writer: BufWriter<File>,
}

impl MetricsWriter {
    pub fn create(out_dir: &Path) -> Result<Self> {
        let file = File::create(out_dir.join("metrics.csv")).map_err(|source| {
            ArtifactError::Write {
                artifact: "metrics.csv",
                source,
            }
        })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CSV_HEADER}").map_err(|source| ArtifactError::Write {
            artifact: "metrics.csv",
            source,
        })?;
        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &MetricsRow) -> Result<()> {
        writeln!(self.writer, "{}", row.to_csv_line()).map_err(|source| {
            ArtifactError::Write {
                artifact: "metrics.csv",
                source,
            }
            .into()
        })
    }

    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(|source| {
            ArtifactError::Write {
                artifact: "metrics.csv",
                source,
            }
            .into()
        })
    }
}

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    t_ms: u64,
    side: Option<&'a str>,
    #[serde(rename = "type")]
    event_type: &'a str,
    payload: &'a JsonValue,
}

/// `events.jsonl` sink. Also keeps per-type occurrence times so the
/// post-run acceptance check can replay expectations without re-reading
/// the file.
pub struct EventLog {
    writer: BufWriter<File>,
    occurrences: HashMap<String, Vec<u64>>,
}

impl EventLog {
    pub fn create(out_dir: &Path) -> Result<Self> {
        let file = File::create(out_dir.join("events.jsonl")).map_err(|source| {
            ArtifactError::Write {
                artifact: "events.jsonl",
                source,
            }
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            occurrences: HashMap::new(),
        })
    }

    pub fn append(
        &mut self,
        t_ms: u64,
        side: Option<Side>,
        event_type: &str,
        payload: &JsonValue,
    ) -> Result<()> {
        let record = EventRecord {
            t_ms,
            side: side.map(Side::label),
            event_type,
            payload,
        };
        let line = serde_json::to_string(&record).map_err(|e| ArtifactError::Serialize {
            artifact: "events.jsonl",
            reason: e.to_string(),
        })?;
        writeln!(self.writer, "{line}").map_err(|source| ArtifactError::Write {
            artifact: "events.jsonl",
            source,
        })?;
        self.occurrences
            .entry(event_type.to_string())
            .or_default()
            .push(t_ms);
        Ok(())
    }

    /// How many times `event_type` occurred, optionally only counting
    /// occurrences at or before `by_t_ms`.
    pub fn count(&self, event_type: &str, by_t_ms: Option<u64>) -> usize {
        match self.occurrences.get(event_type) {
            None => 0,
            Some(times) => match by_t_ms {
                None => times.len(),
                Some(deadline) => times.iter().filter(|&&t| t <= deadline).count(),
            },
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(|source| {
            ArtifactError::Write {
                artifact: "events.jsonl",
                source,
            }
            .into()
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum LinkSample {
    Enqueued,
    Dropped,
    Reordered,
    Delivered { delay_ms: f64 },
    SduBytes { bytes: usize },
}

/// Rolling per-direction link statistics over the logical metrics window.
#[derive(Debug)]
pub struct LinkWindow {
    window_ms: u64,
    samples: VecDeque<(u64, LinkSample)>,
}

impl Default for LinkWindow {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_WINDOW_MS)
    }
}

impl LinkWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, t_ms: u64, sample: LinkSample) {
        self.samples.push_back((t_ms, sample));
    }

    pub fn record_enqueued(&mut self, t_ms: u64) {
        self.push(t_ms, LinkSample::Enqueued);
    }

    pub fn record_drop(&mut self, t_ms: u64) {
        // A dropped PDU still counts as enqueued for the loss denominator.
        self.push(t_ms, LinkSample::Enqueued);
        self.push(t_ms, LinkSample::Dropped);
    }

    pub fn record_delivery(&mut self, t_ms: u64, delay_ms: f64, reordered: bool) {
        self.push(t_ms, LinkSample::Delivered { delay_ms });
        if reordered {
            self.push(t_ms, LinkSample::Reordered);
        }
    }

    pub fn record_sdu(&mut self, t_ms: u64, bytes: usize) {
        self.push(t_ms, LinkSample::SduBytes { bytes });
    }

    /// Drop samples that fell out of the window ending at `t_ms`.
    pub fn prune(&mut self, t_ms: u64) {
        let horizon = t_ms.saturating_sub(self.window_ms);
        while let Some(&(sample_t, _)) = self.samples.front() {
            if sample_t >= horizon {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn count(&self, matches: impl Fn(&LinkSample) -> bool) -> usize {
        self.samples.iter().filter(|(_, s)| matches(s)).count()
    }

    pub fn loss_rate(&self) -> Option<f64> {
        let enqueued = self.count(|s| matches!(s, LinkSample::Enqueued));
        (enqueued > 0).then(|| {
            self.count(|s| matches!(s, LinkSample::Dropped)) as f64 / enqueued as f64
        })
    }

    pub fn reorder_rate(&self) -> Option<f64> {
        let enqueued = self.count(|s| matches!(s, LinkSample::Enqueued));
        (enqueued > 0).then(|| {
            self.count(|s| matches!(s, LinkSample::Reordered)) as f64 / enqueued as f64
        })
    }

    fn delays(&self) -> Vec<f64> {
        self.samples
            .iter()
            .filter_map(|(_, s)| match s {
                LinkSample::Delivered { delay_ms } => Some(*delay_ms),
                _ => None,
            })
            .collect()
    }

    /// Mean one-way delay of PDUs delivered in the window.
    pub fn mean_delay_ms(&self) -> Option<f64> {
        let delays = self.delays();
        (!delays.is_empty()).then(|| delays.iter().sum::<f64>() / delays.len() as f64)
    }

    /// Mean absolute deviation of one-way delays in the window.
    pub fn jitter_ms(&self) -> Option<f64> {
        let delays = self.delays();
        if delays.is_empty() {
            return None;
        }
        let mean = delays.iter().sum::<f64>() / delays.len() as f64;
        Some(delays.iter().map(|d| (d - mean).abs()).sum::<f64>() / delays.len() as f64)
    }

    /// Reassembled SDU bytes delivered in the window, as bits per second.
    pub fn goodput_bps(&self) -> Option<f64> {
        let bytes: usize = self
            .samples
            .iter()
            .filter_map(|(_, s)| match s {
                LinkSample::SduBytes { bytes } => Some(*bytes),
                _ => None,
            })
            .sum();
        let window_s = self.window_ms as f64 / 1_000.0;
        (!self.samples.is_empty()).then(|| bytes as f64 * 8.0 / window_s)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    #[test]
    fn csv_line_leaves_unobserved_cells_blank() {
        let mut row = MetricsRow::new(120, Side::Left, "bytelink", "tick");
        row.loss_rate = Some(0.25);
        let line = row.to_csv_line();
        assert!(line.starts_with("120,L,bytelink,tick,"));
        assert_eq!(line.matches(',').count(), CSV_HEADER.matches(',').count());
        assert!(line.contains(",0.250,"));
    }

    #[test]
    fn writer_emits_header_and_rows() {
        let dir = tempdir().unwrap();
        let mut writer = MetricsWriter::create(dir.path()).unwrap();
        writer
            .write_row(&MetricsRow::new(0, Side::Right, "audio", "tick"))
            .unwrap();
        writer.finish().unwrap();

        let text = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert!(lines.next().unwrap().starts_with("0,R,audio,tick"));
    }

    #[test]
    fn event_log_counts_by_deadline() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::create(dir.path()).unwrap();
        let payload = serde_json::json!({"n": 1});
        log.append(500, Some(Side::Left), "pong", &payload).unwrap();
        log.append(1_500, Some(Side::Left), "pong", &payload).unwrap();
        log.finish().unwrap();

        assert_eq!(log.count("pong", None), 2);
        assert_eq!(log.count("pong", Some(1_000)), 1);
        assert_eq!(log.count("absent", None), 0);

        let text = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "pong");
        assert_eq!(first["side"], "L");
        assert_eq!(first["t_ms"], 500);
    }

    #[test]
    fn window_rates_follow_recorded_samples() {
        let mut window = LinkWindow::new(1_000);
        for t in 0..10 {
            window.record_enqueued(t * 20);
        }
        window.record_drop(200);
        window.record_delivery(220, 40.0, false);
        window.record_delivery(240, 60.0, true);
        window.record_sdu(240, 125);

        window.prune(240);
        assert_relative_eq!(window.loss_rate().unwrap(), 1.0 / 11.0);
        assert_relative_eq!(window.reorder_rate().unwrap(), 1.0 / 11.0);
        assert_relative_eq!(window.mean_delay_ms().unwrap(), 50.0);
        assert_relative_eq!(window.jitter_ms().unwrap(), 10.0);
        assert_relative_eq!(window.goodput_bps().unwrap(), 1_000.0);
    }

    #[test]
    fn pruning_expires_old_samples() {
        let mut window = LinkWindow::new(1_000);
        window.record_drop(0);
        window.record_enqueued(0);
        window.prune(500);
        assert!(!window.is_empty());
        window.prune(1_100);
        assert!(window.is_empty());
        assert_eq!(window.loss_rate(), None);
    }
}
