//! Windowed network statistics.
//!
//! The transport reports cumulative per-stream counters on its own cadence.
//! This module turns them into bandwidth and packet-loss figures recomputed
//! once per window, for the single subscriber stream and each publisher
//! stream independently.

/// How often derived figures are recomputed.
#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {
    pub window_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { window_ms: 3_000 }
    }
}

/// One cumulative counter snapshot for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStreamStats {
    pub bytes: u64,
    /// Packets sent (publisher) or received (subscriber).
    pub packets: u64,
    pub packets_lost: u64,
    pub timestamp_ms: u64,
}

/// Derived figures for one stream. Values persist between windows; they are
/// never zeroed just because a window hasn't elapsed yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub bandwidth_bits_per_second: f64,
    pub packet_loss_ratio: f64,
    pub last_updated_ms: u64,
}

impl Default for WindowStats {
    fn default() -> Self {
        Self {
            bandwidth_bits_per_second: 0.0,
            packet_loss_ratio: 0.0,
            last_updated_ms: 0,
        }
    }
}

/// Per-stream windowing state.
#[derive(Debug, Clone, Default)]
struct StreamWindow {
    seeded: bool,
    last_timestamp_ms: u64,
    last_bytes: u64,
    last_packets: u64,
    last_packets_lost: u64,
    derived: WindowStats,
}

impl StreamWindow {
    fn record(&mut self, raw: &RawStreamStats, window_ms: u64) {
        if !self.seeded {
            self.seed(raw);
            return;
        }

        // Counter reset on the transport side: reseed, skip this tick.
        if raw.bytes < self.last_bytes {
            self.seed(raw);
            return;
        }

        let elapsed_ms = raw.timestamp_ms.saturating_sub(self.last_timestamp_ms);
        if elapsed_ms < window_ms {
            return;
        }

        let byte_delta = raw.bytes - self.last_bytes;
        self.derived.bandwidth_bits_per_second =
            (8 * byte_delta) as f64 / (elapsed_ms as f64 / 1_000.0);

        // Loss ratio is only recomputed when the previous packet counter was
        // non-zero, so the first window after a counter reset never reports
        // loss. Downstream consumers may depend on the dampened first sample.
        if self.last_packets > 0 {
            let lost_delta = raw.packets_lost.saturating_sub(self.last_packets_lost);
            let packet_delta = raw.packets.saturating_sub(self.last_packets);
            let total = lost_delta + packet_delta;
            if total > 0 {
                self.derived.packet_loss_ratio = lost_delta as f64 / total as f64;
            }
        }

        self.derived.last_updated_ms = raw.timestamp_ms;
        self.last_timestamp_ms = raw.timestamp_ms;
        self.last_bytes = raw.bytes;
        self.last_packets = raw.packets;
        self.last_packets_lost = raw.packets_lost;
    }

    fn seed(&mut self, raw: &RawStreamStats) {
        self.seeded = true;
        self.last_timestamp_ms = raw.timestamp_ms;
        self.last_bytes = raw.bytes;
        self.last_packets = raw.packets;
        self.last_packets_lost = raw.packets_lost;
    }
}

/// Aggregates raw counter reports into windowed figures for the subscriber
/// stream and the current set of publisher streams.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    config: StatsConfig,
    subscriber: StreamWindow,
    publishers: Vec<StreamWindow>,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            subscriber: StreamWindow::default(),
            publishers: Vec::new(),
        }
    }

    /// Feed one cumulative snapshot for the subscriber stream.
    pub fn record_subscriber(&mut self, raw: &RawStreamStats) {
        self.subscriber.record(raw, self.config.window_ms);
    }

    /// Feed one index-aligned batch of publisher snapshots.
    ///
    /// A change in the number of reported streams discards the stored array
    /// and starts over with zeroed entries. Per-connection continuity across
    /// a count change is intentionally not preserved.
    pub fn record_publishers(&mut self, raws: &[RawStreamStats]) {
        if raws.len() != self.publishers.len() {
            self.publishers = vec![StreamWindow::default(); raws.len()];
        }
        for (window, raw) in self.publishers.iter_mut().zip(raws) {
            window.record(raw, self.config.window_ms);
        }
    }

    pub fn subscriber_stats(&self) -> WindowStats {
        self.subscriber.derived
    }

    pub fn publisher_stats(&self) -> Vec<WindowStats> {
        self.publishers.iter().map(|w| w.derived).collect()
    }

    /// Drop all windowing state (new visit, sign-out).
    pub fn reset(&mut self) {
        self.subscriber = StreamWindow::default();
        self.publishers.clear();
    }
}
