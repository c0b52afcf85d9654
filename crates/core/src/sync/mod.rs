//! Multi-stream temporal synchronizer
//!
//! Aligns samples from N independently sampled, independently clocked
//! sources into [`SynchronizedFrame`]s. Ingest never blocks: samples are
//! matched on arrival and frames are pushed through an unbounded channel.
//! Per-source ring buffers are bounded; overflow drops the oldest sample and
//! increments that source's drop counter.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Synchronization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Trust device timestamps; align within a fixed tolerance window
    HardwareTimestamp,
    /// Arrival-time based with per-source EMA drift compensation
    SoftwareTimestamp,
    /// Bounded ring buffers; each `tick` emits the nearest in-window sample
    /// per source, flagging absent sources as missing
    BufferBased,
    /// Emit only on an external `trigger`, pulling each source's most
    /// recent buffered sample regardless of recency
    EventDriven,
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Required source ids; a frame covers exactly these
    pub sources: Vec<String>,

    /// Alignment mode
    #[serde(default = "default_mode")]
    pub mode: SyncMode,

    /// Alignment tolerance window, milliseconds
    #[serde(default = "default_tolerance_ms", alias = "toleranceMs")]
    pub tolerance_ms: u64,

    /// Per-source ring buffer capacity
    #[serde(default = "default_buffer_capacity", alias = "bufferCapacity")]
    pub buffer_capacity: usize,

    /// Frames scoring below this are logged as low quality
    #[serde(default = "default_quality_floor", alias = "qualityFloor")]
    pub quality_floor: f64,

    /// Suppress sub-floor frames instead of emitting them
    #[serde(default)]
    pub strict: bool,

    /// EMA smoothing factor for software-timestamp drift compensation
    #[serde(default = "default_ema_alpha", alias = "emaAlpha")]
    pub ema_alpha: f64,

    /// Quality penalty per missing source
    #[serde(default = "default_missing_penalty", alias = "missingPenalty")]
    pub missing_penalty: f64,
}

fn default_mode() -> SyncMode {
    SyncMode::HardwareTimestamp
}

fn default_tolerance_ms() -> u64 {
    50
}

fn default_buffer_capacity() -> usize {
    32
}

fn default_quality_floor() -> f64 {
    0.5
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_missing_penalty() -> f64 {
    0.25
}

impl SyncConfig {
    /// Config for the given sources, defaults elsewhere
    pub fn for_sources<I: IntoIterator<Item = S>, S: Into<String>>(sources: I) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            mode: default_mode(),
            tolerance_ms: default_tolerance_ms(),
            buffer_capacity: default_buffer_capacity(),
            quality_floor: default_quality_floor(),
            strict: false,
            ema_alpha: default_ema_alpha(),
            missing_penalty: default_missing_penalty(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("synchronizer needs at least one source".into()));
        }
        if self.tolerance_ms == 0 {
            return Err(Error::Config("tolerance_ms must be positive".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.ema_alpha) || self.ema_alpha == 0.0 {
            return Err(Error::Config("ema_alpha must be in (0, 1]".into()));
        }
        Ok(())
    }
}

/// One sample from one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSample {
    /// Originating source id
    pub source_id: String,
    /// Sample payload
    pub payload: Value,
    /// Hardware- or software-derived timestamp, microseconds
    pub timestamp_us: u64,
    /// Per-source sequence number
    pub sequence: u64,
}

/// A time-aligned bundle of samples within one synchronization window
#[derive(Debug, Clone, Serialize)]
pub struct SynchronizedFrame {
    /// Samples by source id, restricted to one window
    pub samples: HashMap<String, StreamSample>,
    /// Required sources with no in-window sample (explicit, never omitted)
    pub missing: Vec<String>,
    /// Alignment quality in [0,1]
    pub quality: f64,
    /// Window anchor timestamp, microseconds
    pub anchor_us: u64,
}

impl SynchronizedFrame {
    /// Whether every required source contributed a sample
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Per-source counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    /// Samples accepted into the ring buffer
    pub ingested: u64,
    /// Samples dropped (overflow or staleness)
    pub dropped: u64,
}

/// Synchronizer counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Per-source ingest/drop counters
    pub sources: HashMap<String, SourceStats>,
    /// Frames pushed to the consumer
    pub frames_emitted: u64,
    /// Sub-floor frames suppressed in strict mode
    pub frames_suppressed: u64,
    /// Emitted frames that scored below the quality floor
    pub low_quality_frames: u64,
}

struct SourceState {
    buffer: VecDeque<StreamSample>,
    // Effective (drift-compensated) timestamps, parallel to `buffer`.
    effective_us: VecDeque<u64>,
    ema_offset_us: Option<f64>,
    stats: SourceStats,
}

impl SourceState {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            effective_us: VecDeque::new(),
            ema_offset_us: None,
            stats: SourceStats::default(),
        }
    }
}

struct SyncState {
    sources: HashMap<String, SourceState>,
    frames_emitted: u64,
    frames_suppressed: u64,
    low_quality_frames: u64,
}

/// Multi-stream temporal synchronizer
///
/// Created together with the receiving end of its emission channel:
///
/// ```ignore
/// let (sync, mut frames) = StreamSynchronizer::new(SyncConfig::for_sources(["face", "audio"]))?;
/// sync.ingest(sample);
/// while let Some(frame) = frames.recv().await { /* ... */ }
/// ```
pub struct StreamSynchronizer {
    config: SyncConfig,
    state: parking_lot::Mutex<SyncState>,
    tx: mpsc::UnboundedSender<SynchronizedFrame>,
}

impl StreamSynchronizer {
    /// Create a synchronizer and the receiver for emitted frames
    pub fn new(
        config: SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SynchronizedFrame>)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sources = config
            .sources
            .iter()
            .map(|s| (s.clone(), SourceState::new()))
            .collect();
        Ok((
            Self {
                config,
                state: parking_lot::Mutex::new(SyncState {
                    sources,
                    frames_emitted: 0,
                    frames_suppressed: 0,
                    low_quality_frames: 0,
                }),
                tx,
            },
            rx,
        ))
    }

    /// Ingest one sample; never blocks
    ///
    /// Samples from unknown sources are rejected with `Error::Config`. In
    /// the timestamp-driven modes this may immediately emit a frame.
    pub fn ingest(&self, sample: StreamSample) -> Result<()> {
        {
            let mut state = self.state.lock();
            let source = state.sources.get_mut(&sample.source_id).ok_or_else(|| {
                Error::Config(format!("unknown source '{}'", sample.source_id))
            })?;

            let effective_us = match self.config.mode {
                SyncMode::SoftwareTimestamp => {
                    // EMA of (arrival - device timestamp) maps the device
                    // clock onto the shared arrival clock.
                    let offset = now_us() as f64 - sample.timestamp_us as f64;
                    let alpha = self.config.ema_alpha;
                    let ema = match source.ema_offset_us {
                        Some(prev) => prev + alpha * (offset - prev),
                        None => offset,
                    };
                    source.ema_offset_us = Some(ema);
                    (sample.timestamp_us as f64 + ema).max(0.0) as u64
                }
                _ => sample.timestamp_us,
            };

            if source.buffer.len() == self.config.buffer_capacity {
                source.buffer.pop_front();
                source.effective_us.pop_front();
                source.stats.dropped += 1;
                tracing::debug!(source = %sample.source_id, "ring buffer overflow, dropped oldest");
            }
            source.stats.ingested += 1;
            source.buffer.push_back(sample);
            source.effective_us.push_back(effective_us);
        }

        match self.config.mode {
            SyncMode::HardwareTimestamp | SyncMode::SoftwareTimestamp => {
                self.try_emit_aligned();
            }
            SyncMode::BufferBased | SyncMode::EventDriven => {}
        }
        Ok(())
    }

    /// Emission tick for `buffer_based` mode
    ///
    /// Picks the nearest in-window sample per source around the newest
    /// buffered timestamp; absent sources are flagged missing and the frame
    /// is still emitted (partial). No-op in other modes.
    pub fn tick(&self) {
        if self.config.mode != SyncMode::BufferBased {
            return;
        }
        let tolerance_us = self.config.tolerance_ms * 1_000;
        let mut state = self.state.lock();

        let anchor = state
            .sources
            .values()
            .filter_map(|s| s.effective_us.back().copied())
            .max();
        let Some(anchor_us) = anchor else {
            return; // nothing buffered anywhere
        };

        let mut samples = HashMap::new();
        let mut effective = Vec::new();
        let mut missing = Vec::new();
        for name in &self.config.sources {
            let source = match state.sources.get_mut(name) {
                Some(s) => s,
                None => continue,
            };
            match take_nearest(source, anchor_us, Some(tolerance_us)) {
                Some((sample, eff_us)) => {
                    samples.insert(name.clone(), sample);
                    effective.push(eff_us);
                }
                None => missing.push(name.clone()),
            }
        }
        self.finish_frame(&mut state, samples, effective, missing, anchor_us);
    }

    /// External trigger for `event_driven` mode
    ///
    /// Pulls each source's most recent buffered sample regardless of
    /// recency. No-op in other modes.
    pub fn trigger(&self) {
        if self.config.mode != SyncMode::EventDriven {
            return;
        }
        let mut state = self.state.lock();
        let anchor_us = state
            .sources
            .values()
            .filter_map(|s| s.effective_us.back().copied())
            .max()
            .unwrap_or_else(now_us);

        let mut samples = HashMap::new();
        let mut effective = Vec::new();
        let mut missing = Vec::new();
        for name in &self.config.sources {
            let source = match state.sources.get_mut(name) {
                Some(s) => s,
                None => continue,
            };
            match take_nearest(source, anchor_us, None) {
                Some((sample, eff_us)) => {
                    samples.insert(name.clone(), sample);
                    effective.push(eff_us);
                }
                None => missing.push(name.clone()),
            }
        }
        self.finish_frame(&mut state, samples, effective, missing, anchor_us);
    }

    /// Counters snapshot
    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        SyncStats {
            sources: state
                .sources
                .iter()
                .map(|(k, v)| (k.clone(), v.stats.clone()))
                .collect(),
            frames_emitted: state.frames_emitted,
            frames_suppressed: state.frames_suppressed,
            low_quality_frames: state.low_quality_frames,
        }
    }

    /// Timestamp-driven alignment: emit while every source has an
    /// in-window sample around the current anchor.
    fn try_emit_aligned(&self) {
        let tolerance_us = self.config.tolerance_ms * 1_000;
        loop {
            let mut state = self.state.lock();
            if state.sources.values().any(|s| s.buffer.is_empty()) {
                return;
            }

            // Anchor on the latest "oldest buffered" timestamp: no source
            // can contribute anything earlier than its own front.
            let anchor_us = state
                .sources
                .values()
                .filter_map(|s| s.effective_us.front().copied())
                .max()
                .unwrap_or(0);

            // Drop samples that can never align (older than the window).
            for source in state.sources.values_mut() {
                while let Some(&front) = source.effective_us.front() {
                    if front + tolerance_us < anchor_us {
                        source.buffer.pop_front();
                        source.effective_us.pop_front();
                        source.stats.dropped += 1;
                    } else {
                        break;
                    }
                }
                if source.buffer.is_empty() {
                    return; // wait for more data on this source
                }
            }

            let mut samples = HashMap::new();
            let mut effective = Vec::new();
            for name in &self.config.sources {
                let source = match state.sources.get_mut(name) {
                    Some(s) => s,
                    None => continue,
                };
                match take_nearest(source, anchor_us, Some(tolerance_us)) {
                    Some((sample, eff_us)) => {
                        samples.insert(name.clone(), sample);
                        effective.push(eff_us);
                    }
                    None => return, // in-window sample missing; wait
                }
            }
            self.finish_frame(&mut state, samples, effective, Vec::new(), anchor_us);
        }
    }

    fn finish_frame(
        &self,
        state: &mut SyncState,
        samples: HashMap<String, StreamSample>,
        effective_us: Vec<u64>,
        missing: Vec<String>,
        anchor_us: u64,
    ) {
        if samples.is_empty() {
            return;
        }
        let quality = self.quality_score(&effective_us, missing.len());
        if quality < self.config.quality_floor {
            let soft = Error::SynchronizationQuality {
                score: quality,
                floor: self.config.quality_floor,
            };
            if self.config.strict {
                state.frames_suppressed += 1;
                tracing::warn!(error = %soft, "suppressed low-quality frame (strict mode)");
                return;
            }
            state.low_quality_frames += 1;
            tracing::warn!(error = %soft, "emitting low-quality frame");
        }
        let frame = SynchronizedFrame {
            samples,
            missing,
            quality,
            anchor_us,
        };
        state.frames_emitted += 1;
        if self.tx.send(frame).is_err() {
            tracing::debug!("frame receiver dropped");
        }
    }

    /// Quality = 1 − normalize(max pairwise spread), penalized per missing
    /// source, clamped to [0,1]. The spread is measured on the effective
    /// timestamps alignment matched on, so drift compensation carries into
    /// the score.
    fn quality_score(&self, effective_us: &[u64], missing: usize) -> f64 {
        let tolerance_us = (self.config.tolerance_ms * 1_000) as f64;
        let min = effective_us.iter().copied().min().unwrap_or(0);
        let max = effective_us.iter().copied().max().unwrap_or(0);
        let spread = (max - min) as f64;
        let base = 1.0 - (spread / tolerance_us).min(1.0);
        (base - missing as f64 * self.config.missing_penalty).clamp(0.0, 1.0)
    }
}

/// Take the buffered sample nearest to `anchor_us`, removing it (and
/// everything older) from the ring. `window_us` restricts the pick to the
/// tolerance window; `None` accepts any recency. Returns the sample with
/// the effective timestamp it was aligned on.
fn take_nearest(
    source: &mut SourceState,
    anchor_us: u64,
    window_us: Option<u64>,
) -> Option<(StreamSample, u64)> {
    let mut best: Option<(usize, u64)> = None;
    for (i, &ts) in source.effective_us.iter().enumerate() {
        let distance = ts.abs_diff(anchor_us);
        if let Some(window) = window_us {
            if distance > window {
                continue;
            }
        }
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((i, distance)),
        }
    }
    let (index, _) = best?;
    // Consume the pick and everything older; later samples stay buffered.
    let mut picked = None;
    for _ in 0..=index {
        picked = source.buffer.pop_front().zip(source.effective_us.pop_front());
    }
    picked
}

/// Current wall-clock time in microseconds
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(source: &str, ts_ms: u64, seq: u64) -> StreamSample {
        StreamSample {
            source_id: source.to_string(),
            payload: json!({"seq": seq}),
            timestamp_us: ts_ms * 1_000,
            sequence: seq,
        }
    }

    fn config(sources: &[&str], mode: SyncMode) -> SyncConfig {
        SyncConfig {
            mode,
            ..SyncConfig::for_sources(sources.iter().copied())
        }
    }

    #[test]
    fn rejects_unknown_source() {
        let (sync, _rx) =
            StreamSynchronizer::new(config(&["a"], SyncMode::HardwareTimestamp)).unwrap();
        let err = sync.ingest(sample("b", 0, 0)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_source_list_is_invalid() {
        let result = StreamSynchronizer::new(SyncConfig::for_sources(Vec::<String>::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hardware_mode_emits_aligned_frames() {
        let (sync, mut rx) =
            StreamSynchronizer::new(config(&["face", "audio"], SyncMode::HardwareTimestamp))
                .unwrap();

        sync.ingest(sample("face", 100, 1)).unwrap();
        assert!(rx.try_recv().is_err()); // audio still missing

        sync.ingest(sample("audio", 110, 1)).unwrap();
        let frame = rx.try_recv().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.samples.len(), 2);
        assert_eq!(frame.samples["face"].sequence, 1);
        assert!(frame.quality > 0.5);
    }

    #[tokio::test]
    async fn hardware_mode_waits_outside_tolerance() {
        let (sync, mut rx) =
            StreamSynchronizer::new(config(&["a", "b"], SyncMode::HardwareTimestamp)).unwrap();

        // 200ms apart with a 50ms window: the stale sample is discarded and
        // no frame is emitted.
        sync.ingest(sample("a", 100, 1)).unwrap();
        sync.ingest(sample("b", 300, 1)).unwrap();
        assert!(rx.try_recv().is_err());

        // A fresh in-window sample on "a" completes a frame.
        sync.ingest(sample("a", 310, 2)).unwrap();
        let frame = rx.try_recv().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.samples["a"].sequence, 2);
        assert_eq!(sync.stats().sources["a"].dropped, 1);
    }

    #[tokio::test]
    async fn quality_decreases_with_spread() {
        let mk = |spread_ms: u64| {
            let (sync, mut rx) =
                StreamSynchronizer::new(config(&["a", "b"], SyncMode::HardwareTimestamp)).unwrap();
            sync.ingest(sample("a", 1000, 1)).unwrap();
            sync.ingest(sample("b", 1000 + spread_ms, 1)).unwrap();
            rx.try_recv().unwrap().quality
        };
        let q0 = mk(0);
        let q10 = mk(10);
        let q40 = mk(40);
        assert!(q0 >= q10);
        assert!(q10 >= q40);
        assert!((q0 - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn software_mode_scores_on_the_compensated_clock() {
        let (sync, mut rx) =
            StreamSynchronizer::new(config(&["a", "b"], SyncMode::SoftwareTimestamp)).unwrap();

        // Device clocks 10 seconds apart; the samples arrive back to back,
        // so their compensated timestamps line up. The score must reflect
        // the compensated spread, not the raw 10s gap.
        sync.ingest(sample("a", 1_000, 1)).unwrap();
        sync.ingest(sample("b", 11_000, 1)).unwrap();

        let frame = rx.try_recv().unwrap();
        assert!(frame.is_complete());
        assert!(
            frame.quality > 0.5,
            "quality {} should score the aligned clock",
            frame.quality
        );
    }

    #[tokio::test]
    async fn buffer_based_tick_flags_missing_sources() {
        let (sync, mut rx) =
            StreamSynchronizer::new(config(&["a", "b"], SyncMode::BufferBased)).unwrap();

        sync.ingest(sample("a", 500, 1)).unwrap();
        sync.tick();

        let frame = rx.try_recv().unwrap();
        assert!(!frame.is_complete());
        assert_eq!(frame.missing, vec!["b".to_string()]);
        assert!(frame.samples.contains_key("a"));
        // Missing-source penalty applies on top of the spread score.
        assert!(frame.quality < 1.0);
    }

    #[tokio::test]
    async fn event_driven_pulls_latest_regardless_of_recency() {
        let (sync, mut rx) =
            StreamSynchronizer::new(config(&["a", "b"], SyncMode::EventDriven)).unwrap();

        sync.ingest(sample("a", 100, 1)).unwrap();
        sync.ingest(sample("a", 200, 2)).unwrap();
        sync.ingest(sample("b", 5000, 1)).unwrap();
        assert!(rx.try_recv().is_err()); // nothing without a trigger

        sync.trigger();
        let frame = rx.try_recv().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.samples["a"].sequence, 2); // most recent, not nearest
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let mut cfg = config(&["a", "b"], SyncMode::EventDriven);
        cfg.buffer_capacity = 2;
        let (sync, _rx) = StreamSynchronizer::new(cfg).unwrap();

        sync.ingest(sample("a", 1, 1)).unwrap();
        sync.ingest(sample("a", 2, 2)).unwrap();
        sync.ingest(sample("a", 3, 3)).unwrap();

        assert_eq!(sync.stats().sources["a"].dropped, 1);
    }

    #[tokio::test]
    async fn strict_mode_suppresses_low_quality_frames() {
        let mut cfg = config(&["a", "b"], SyncMode::BufferBased);
        cfg.strict = true;
        cfg.quality_floor = 0.9;
        let (sync, mut rx) = StreamSynchronizer::new(cfg).unwrap();

        // Only one of two sources: missing penalty pulls quality below 0.9.
        sync.ingest(sample("a", 500, 1)).unwrap();
        sync.tick();

        assert!(rx.try_recv().is_err());
        let stats = sync.stats();
        assert_eq!(stats.frames_suppressed, 1);
        assert_eq!(stats.frames_emitted, 0);
    }
}
