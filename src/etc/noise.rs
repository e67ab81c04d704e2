use crate::etc::transaction::EtcTransaction;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The noise families real ETC hardware exhibits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    MissedRead,
    DuplicateRead,
    DelayedUpload,
    ClockDrift,
}

impl fmt::Display for NoiseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoiseKind::MissedRead => "missed_read",
            NoiseKind::DuplicateRead => "duplicate_read",
            NoiseKind::DelayedUpload => "delayed_upload",
            NoiseKind::ClockDrift => "clock_drift",
        };
        write!(f, "{}", s)
    }
}

/// Noise stage configuration: per-injector probabilities and ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub missed_read_rate: f64,
    pub duplicate_read_rate: f64,
    pub delayed_upload_rate: f64,
    pub delayed_upload_range: (f64, f64),
    pub clock_drift_rate: f64,
    pub clock_drift_range: (f64, f64),
    pub enabled: bool,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        NoiseConfig {
            missed_read_rate: 0.03,
            duplicate_read_rate: 0.02,
            delayed_upload_rate: 0.05,
            delayed_upload_range: (1.0, 5.0),
            clock_drift_rate: 0.10,
            clock_drift_range: (-0.5, 0.5),
            enabled: true,
        }
    }
}

/// One fired injection, recorded for the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseEvent {
    #[serde(rename = "type")]
    pub kind: NoiseKind,
    pub vehicle_id: u64,
    pub gantry_id: String,
    pub original_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_timestamp: Option<f64>,
    pub is_dropped: bool,
    pub duplicate_count: u32,
    pub description: String,
}

/// Running counters over everything the stage has processed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoiseStatistics {
    pub total_processed: u64,
    pub missed_read_count: u64,
    pub duplicate_read_count: u64,
    pub delayed_upload_count: u64,
    pub clock_drift_count: u64,
    pub missed_read_rate_actual: f64,
    pub duplicate_read_rate_actual: f64,
}

/// A single noise injector. Injectors are independent: each flips its
/// own coin against the configured rate and rewrites the transactions
/// it is handed.
trait NoiseInjector {
    fn kind(&self) -> NoiseKind;
    fn should_inject(&self, config: &NoiseConfig, rng: &mut StdRng) -> bool;
    fn inject(
        &self,
        tx: &EtcTransaction,
        config: &NoiseConfig,
        rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, NoiseEvent);
}

/// Drops the read entirely. Highest priority: nothing downstream runs.
struct MissedReadInjector;

impl NoiseInjector for MissedReadInjector {
    fn kind(&self) -> NoiseKind {
        NoiseKind::MissedRead
    }
    fn should_inject(&self, config: &NoiseConfig, rng: &mut StdRng) -> bool {
        rng.random::<f64>() < config.missed_read_rate
    }
    fn inject(
        &self,
        tx: &EtcTransaction,
        _config: &NoiseConfig,
        _rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, NoiseEvent) {
        let event = NoiseEvent {
            kind: NoiseKind::MissedRead,
            vehicle_id: tx.vehicle_id,
            gantry_id: tx.gantry_id.clone(),
            original_timestamp: tx.timestamp,
            modified_timestamp: None,
            is_dropped: true,
            duplicate_count: 1,
            description: "transaction dropped, no record produced".to_string(),
        };
        (Vec::new(), event)
    }
}

/// Emits 2-3 copies with sub-0.1 s timestamp jitter.
struct DuplicateReadInjector;

impl NoiseInjector for DuplicateReadInjector {
    fn kind(&self) -> NoiseKind {
        NoiseKind::DuplicateRead
    }
    fn should_inject(&self, config: &NoiseConfig, rng: &mut StdRng) -> bool {
        rng.random::<f64>() < config.duplicate_read_rate
    }
    fn inject(
        &self,
        tx: &EtcTransaction,
        _config: &NoiseConfig,
        rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, NoiseEvent) {
        let count: u32 = if rng.random::<f64>() < 0.5 { 2 } else { 3 };
        let mut copies = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut copy = tx.clone();
            copy.timestamp = tx.timestamp + rng.random_range(-0.1..0.1) * i as f64;
            copy.is_duplicate = i > 0;
            copies.push(copy);
        }
        let event = NoiseEvent {
            kind: NoiseKind::DuplicateRead,
            vehicle_id: tx.vehicle_id,
            gantry_id: tx.gantry_id.clone(),
            original_timestamp: tx.timestamp,
            modified_timestamp: None,
            is_dropped: false,
            duplicate_count: count,
            description: format!("produced {} duplicate records", count),
        };
        (copies, event)
    }
}

/// Marks the record as arriving late without touching the read time.
struct DelayedUploadInjector;

impl NoiseInjector for DelayedUploadInjector {
    fn kind(&self) -> NoiseKind {
        NoiseKind::DelayedUpload
    }
    fn should_inject(&self, config: &NoiseConfig, rng: &mut StdRng) -> bool {
        rng.random::<f64>() < config.delayed_upload_rate
    }
    fn inject(
        &self,
        tx: &EtcTransaction,
        config: &NoiseConfig,
        rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, NoiseEvent) {
        let (low, high) = config.delayed_upload_range;
        let delay = rng.random_range(low..high);
        let mut delayed = tx.clone();
        delayed.upload_delay = Some(delay);
        delayed.actual_upload_time = Some(tx.timestamp + delay);
        let event = NoiseEvent {
            kind: NoiseKind::DelayedUpload,
            vehicle_id: tx.vehicle_id,
            gantry_id: tx.gantry_id.clone(),
            original_timestamp: tx.timestamp,
            modified_timestamp: Some(tx.timestamp + delay),
            is_dropped: false,
            duplicate_count: 1,
            description: format!("upload delayed by {:.2} s", delay),
        };
        (vec![delayed], event)
    }
}

/// Shifts the timestamp by a per-read clock offset.
struct ClockDriftInjector;

impl NoiseInjector for ClockDriftInjector {
    fn kind(&self) -> NoiseKind {
        NoiseKind::ClockDrift
    }
    fn should_inject(&self, config: &NoiseConfig, rng: &mut StdRng) -> bool {
        rng.random::<f64>() < config.clock_drift_rate
    }
    fn inject(
        &self,
        tx: &EtcTransaction,
        config: &NoiseConfig,
        rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, NoiseEvent) {
        let (low, high) = config.clock_drift_range;
        let drift = rng.random_range(low..high);
        let mut drifted = tx.clone();
        drifted.timestamp = tx.timestamp + drift;
        drifted.clock_drift = Some(drift);
        let event = NoiseEvent {
            kind: NoiseKind::ClockDrift,
            vehicle_id: tx.vehicle_id,
            gantry_id: tx.gantry_id.clone(),
            original_timestamp: tx.timestamp,
            modified_timestamp: Some(tx.timestamp + drift),
            is_dropped: false,
            duplicate_count: 1,
            description: format!("clock drift {:+.3} s", drift),
        };
        (vec![drifted], event)
    }
}

/// The ordered noise pipeline applied to every raw transaction.
///
/// Order matters: a missed read aborts the pipeline, a duplicate read
/// multiplies the records the later injectors then perturb per copy.
pub struct NoiseStage {
    config: NoiseConfig,
    injectors: Vec<Box<dyn NoiseInjector>>,
    stats: NoiseStatistics,
}

impl fmt::Debug for NoiseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseStage")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl NoiseStage {
    pub fn new(config: NoiseConfig) -> Self {
        NoiseStage {
            config,
            injectors: vec![
                Box::new(MissedReadInjector),
                Box::new(DuplicateReadInjector),
                Box::new(DelayedUploadInjector),
                Box::new(ClockDriftInjector),
            ],
            stats: NoiseStatistics::default(),
        }
    }

    /// Runs one raw transaction through the pipeline. Returns the
    /// surviving (possibly multiplied) transactions and the noise
    /// events fired on the way.
    pub fn process(
        &mut self,
        tx: EtcTransaction,
        rng: &mut StdRng,
    ) -> (Vec<EtcTransaction>, Vec<NoiseEvent>) {
        if !self.config.enabled {
            return (vec![tx], Vec::new());
        }

        self.stats.total_processed += 1;
        let mut events = Vec::new();
        let mut current = vec![tx];

        for injector in &self.injectors {
            if !injector.should_inject(&self.config, rng) {
                continue;
            }
            let mut next = Vec::with_capacity(current.len());
            let mut dropped = false;
            for tx in &current {
                let (produced, event) = injector.inject(tx, &self.config, rng);
                dropped = dropped || event.is_dropped;
                Self::count(&mut self.stats, event.kind);
                events.push(event);
                next.extend(produced);
            }
            if dropped {
                self.refresh_rates();
                return (Vec::new(), events);
            }
            current = next;
        }

        self.refresh_rates();
        (current, events)
    }

    /// Running statistics, including realized rates.
    pub fn statistics(&self) -> NoiseStatistics {
        self.stats
    }

    /// Clears the counters (events already emitted are unaffected).
    pub fn reset(&mut self) {
        self.stats = NoiseStatistics::default();
    }

    fn count(stats: &mut NoiseStatistics, kind: NoiseKind) {
        match kind {
            NoiseKind::MissedRead => stats.missed_read_count += 1,
            NoiseKind::DuplicateRead => stats.duplicate_read_count += 1,
            NoiseKind::DelayedUpload => stats.delayed_upload_count += 1,
            NoiseKind::ClockDrift => stats.clock_drift_count += 1,
        }
    }

    fn refresh_rates(&mut self) {
        let total = self.stats.total_processed.max(1) as f64;
        self.stats.missed_read_rate_actual = self.stats.missed_read_count as f64 / total;
        self.stats.duplicate_read_rate_actual = self.stats.duplicate_read_count as f64 / total;
    }
}
