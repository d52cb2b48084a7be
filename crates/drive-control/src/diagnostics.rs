use crate::stage::Stage;
use crate::{ControlError, Result};
use can_transport::CanId;
use core::fmt;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Distinct identifiers tracked before new ones are folded into `untracked`.
pub const MAX_TRACKED_IDS: usize = 16;

#[derive(Clone)]
pub struct BusMetrics {
    pub tx_frames: IntCounter,
    pub rx_frames: IntCounter,
    pub send_errors: IntCounter,
    pub rx_errors: IntCounter,
    pub stage: IntGauge,
}

/// Prometheus registry shared by the link (tx side) and diagnostics (rx side).
#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bus: BusMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let bus = BusMetrics {
            tx_frames: counter("drive_can_tx_frames", "CAN frames sent to the drive")?,
            rx_frames: counter("drive_can_rx_frames", "CAN frames received")?,
            send_errors: counter("drive_can_send_errors", "Sends rejected by the bus")?,
            rx_errors: counter("drive_can_rx_errors", "Receive errors reported by the bus")?,
            stage: IntGauge::new("drive_stage", "Current bring-up stage ordinal")
                .map_err(metrics_err)?,
        };
        for collector in [
            Box::new(bus.tx_frames.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(bus.rx_frames.clone()),
            Box::new(bus.send_errors.clone()),
            Box::new(bus.rx_errors.clone()),
            Box::new(bus.stage.clone()),
        ] {
            registry.register(collector).map_err(metrics_err)?;
        }
        Ok(Self { registry, bus })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::new(name, help).map_err(metrics_err)
}

fn metrics_err(e: prometheus::Error) -> ControlError {
    ControlError::Metrics(e.to_string())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdStats {
    pub id: CanId,
    pub count: u64,
    pub last_seen_ms: u64,
}

/// Point-in-time summary of inbound traffic.
#[derive(Clone, Debug, PartialEq)]
pub struct BusStats {
    pub uptime_ms: u64,
    pub total: u64,
    pub errors: u64,
    pub untracked: u64,
    pub ids: Vec<IdStats>,
}

impl BusStats {
    pub fn rate_per_s(&self) -> f64 {
        if self.uptime_ms == 0 {
            return 0.0;
        }
        self.total as f64 * 1000.0 / self.uptime_ms as f64
    }
}

impl fmt::Display for BusStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus: {} frames, {} errors, {:.1} frames/s over {} s",
            self.total,
            self.errors,
            self.rate_per_s(),
            self.uptime_ms / 1000
        )?;
        for s in &self.ids {
            write!(f, "\n  0x{:03X}: {} (last at {} ms)", s.id.raw(), s.count, s.last_seen_ms)?;
        }
        if self.untracked > 0 {
            write!(f, "\n  other ids: {}", self.untracked)?;
        }
        Ok(())
    }
}

/// Emitted once per silence episode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SilenceNotice {
    pub silent_for_ms: u64,
}

/// Inbound traffic counters plus a one-shot silence watchdog.
pub struct BusDiagnostics {
    started_ms: u64,
    ids: Vec<IdStats>,
    untracked: u64,
    total_rx: u64,
    rx_errors: u64,
    last_rx_ms: Option<u64>,
    silence_reported: bool,
    silence_timeout_ms: u64,
    stats_interval_ms: u64,
    last_stats_ms: u64,
    metrics: MetricsHub,
}

impl BusDiagnostics {
    pub fn new(
        metrics: MetricsHub,
        stats_interval_ms: u64,
        silence_timeout_ms: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            started_ms: now_ms,
            ids: Vec::with_capacity(MAX_TRACKED_IDS),
            untracked: 0,
            total_rx: 0,
            rx_errors: 0,
            last_rx_ms: None,
            silence_reported: false,
            silence_timeout_ms,
            stats_interval_ms,
            last_stats_ms: now_ms,
            metrics,
        }
    }

    pub fn record_rx(&mut self, id: CanId, now_ms: u64) {
        self.total_rx += 1;
        self.last_rx_ms = Some(now_ms);
        self.silence_reported = false;
        self.metrics.bus.rx_frames.inc();
        if let Some(entry) = self.ids.iter_mut().find(|s| s.id == id) {
            entry.count += 1;
            entry.last_seen_ms = now_ms;
        } else if self.ids.len() < MAX_TRACKED_IDS {
            self.ids.push(IdStats {
                id,
                count: 1,
                last_seen_ms: now_ms,
            });
        } else {
            self.untracked += 1;
        }
    }

    pub fn record_rx_error(&mut self) {
        self.rx_errors += 1;
        self.metrics.bus.rx_errors.inc();
    }

    pub fn set_stage(&self, stage: Stage) {
        self.metrics.bus.stage.set(stage.ordinal());
    }

    /// Reports silence once per quiet episode; re-arms on the next frame.
    /// Before the first frame the quiet time counts from construction.
    pub fn check_silence(&mut self, now_ms: u64) -> Option<SilenceNotice> {
        let last = self.last_rx_ms.unwrap_or(self.started_ms);
        let silent_for_ms = now_ms.saturating_sub(last);
        if self.silence_reported || silent_for_ms < self.silence_timeout_ms {
            return None;
        }
        self.silence_reported = true;
        Some(SilenceNotice { silent_for_ms })
    }

    /// A snapshot when the stats interval has elapsed.
    pub fn stats_due(&mut self, now_ms: u64) -> Option<BusStats> {
        if now_ms.saturating_sub(self.last_stats_ms) < self.stats_interval_ms {
            return None;
        }
        self.last_stats_ms = now_ms;
        Some(self.snapshot(now_ms))
    }

    pub fn snapshot(&self, now_ms: u64) -> BusStats {
        BusStats {
            uptime_ms: now_ms.saturating_sub(self.started_ms),
            total: self.total_rx,
            errors: self.rx_errors,
            untracked: self.untracked,
            ids: self.ids.clone(),
        }
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }
}
