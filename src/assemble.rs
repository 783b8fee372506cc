//! Turns decoded notifications into per-modality [`SampleBatch`]es.
//!
//! The headset never sends absolute time. Each modality is stamped from its
//! packet index with a [`TimestampTracker`] and the known sample rate, and
//! every batch leaves here as a `channels × samples` matrix with one
//! timestamp per column.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parse::{
    parse_accelerometer, parse_eeg_packet, parse_gyroscope, parse_ppg_packet, ImuAxes,
};
use crate::protocol::{
    ACCELEROMETER_CHARACTERISTIC, ACC_FREQUENCY, EEG_CHANNEL_COUNT, EEG_CHARACTERISTICS,
    EEG_FREQUENCY, EEG_SAMPLES_PER_READING, GYROSCOPE_CHARACTERISTIC, GYRO_FREQUENCY,
    IMU_SAMPLES_PER_READING, PPG_CHANNEL_COUNT, PPG_CHARACTERISTICS, PPG_FREQUENCY,
    PPG_SAMPLES_PER_READING,
};
use crate::types::{Modality, SampleBatch};

/// Seconds since the Unix epoch.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Seconds on a monotonic clock shared by the whole process.
///
/// Starts near zero when first read and never jumps with wall-clock
/// adjustments.
pub fn bus_clock() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Time base every published timestamp is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Clock {
    /// Unix time, see [`wall_clock`].
    #[default]
    Wall,
    /// Monotonic, see [`bus_clock`].
    Bus,
}

impl Clock {
    pub fn now(self) -> f64 {
        match self {
            Clock::Wall => wall_clock(),
            Clock::Bus => bus_clock(),
        }
    }
}

// ── Timestamp tracker ─────────────────────────────────────────────────────────

/// Reconstructs the time of each notification from the headset's 16-bit
/// packet counter.
///
/// The first packet is anchored to `now − reading duration` so the stamp
/// marks the start of its sample window. Later packets are extrapolated
/// from the index delta, which keeps spacing exact under BLE jitter. Packets
/// behind the anchor are back-dated without moving it.
#[derive(Debug, Clone)]
pub struct TimestampTracker {
    reading_secs: f64,
    anchor: Option<(u16, f64)>,
}

impl TimestampTracker {
    pub fn new(samples_per_reading: usize, frequency: f64) -> Self {
        Self {
            reading_secs: samples_per_reading as f64 / frequency,
            anchor: None,
        }
    }

    /// Timestamp (seconds since epoch) of the first sample in packet `index`.
    pub fn stamp(&mut self, index: u16, now: f64) -> f64 {
        let (last_index, last_ts) = *self
            .anchor
            .get_or_insert((index, now - self.reading_secs));

        let last = last_index as i32;
        let mut idx = index as i32;
        // 0xFFFF → 0x0000 wrap
        while last - idx > 0x1000 {
            idx += 0x10000;
        }

        if idx > last {
            let ts = last_ts + self.reading_secs * (idx - last) as f64;
            self.anchor = Some((index, ts));
            ts
        } else {
            last_ts - self.reading_secs * (last - idx) as f64
        }
    }
}

/// Per-sample timestamps for `count` samples starting at `first`.
pub fn sample_times(first: f64, count: usize, frequency: f64) -> Vec<f64> {
    (0..count).map(|i| first + i as f64 / frequency).collect()
}

// ── Multi-characteristic matrices ─────────────────────────────────────────────

/// Collects one row per characteristic and releases the matrix when the
/// anchor row arrives.
#[derive(Debug)]
struct RowCollector {
    rows: Vec<Vec<f32>>,
    samples: usize,
    anchor: usize,
    frequency: f64,
    tracker: TimestampTracker,
}

impl RowCollector {
    fn new(channels: usize, samples: usize, anchor: usize, frequency: f64) -> Self {
        Self {
            rows: vec![vec![0.0; samples]; channels],
            samples,
            anchor,
            frequency,
            tracker: TimestampTracker::new(samples, frequency),
        }
    }

    fn push(&mut self, row: usize, index: u16, values: Vec<f32>, now: f64) -> Option<SampleBatch> {
        self.rows[row] = values;
        if row != self.anchor {
            return None;
        }
        let first = self.tracker.stamp(index, now);
        let fresh = vec![vec![0.0; self.samples]; self.rows.len()];
        Some(SampleBatch::Matrix {
            rows: std::mem::replace(&mut self.rows, fresh),
            timestamps: sample_times(first, self.samples, self.frequency),
        })
    }
}

fn imu_batch(tracker: &mut TimestampTracker, index: u16, axes: ImuAxes, frequency: f64, now: f64) -> SampleBatch {
    let first = tracker.stamp(index, now);
    SampleBatch::Matrix {
        rows: axes.iter().map(|axis| axis.to_vec()).collect(),
        timestamps: sample_times(first, IMU_SAMPLES_PER_READING, frequency),
    }
}

/// Converts raw sensor notifications into batches, one assembler per session.
///
/// EEG is released on TP10 (electrode 3), the last of the four electrodes
/// every preset streams. The AUX row carries whatever AUX packet arrived
/// since the previous release, zeros otherwise. PPG is released on the red
/// channel.
#[derive(Debug)]
pub struct BatchAssembler {
    eeg: RowCollector,
    ppg: RowCollector,
    acc: TimestampTracker,
    gyro: TimestampTracker,
}

impl Default for BatchAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self {
            eeg: RowCollector::new(EEG_CHANNEL_COUNT, EEG_SAMPLES_PER_READING, 3, EEG_FREQUENCY),
            ppg: RowCollector::new(PPG_CHANNEL_COUNT, PPG_SAMPLES_PER_READING, 2, PPG_FREQUENCY),
            acc: TimestampTracker::new(IMU_SAMPLES_PER_READING, ACC_FREQUENCY),
            gyro: TimestampTracker::new(IMU_SAMPLES_PER_READING, GYRO_FREQUENCY),
        }
    }

    /// Feed one notification. Returns a batch when one is complete.
    pub fn push(&mut self, uuid: Uuid, data: &[u8], now: f64) -> Option<(Modality, SampleBatch)> {
        if let Some(electrode) = EEG_CHARACTERISTICS.iter().position(|&u| u == uuid) {
            let packet = parse_eeg_packet(data)?;
            return self
                .eeg
                .push(electrode, packet.index, packet.values, now)
                .map(|b| (Modality::Eeg, b));
        }
        if let Some(channel) = PPG_CHARACTERISTICS.iter().position(|&u| u == uuid) {
            let packet = parse_ppg_packet(data)?;
            return self
                .ppg
                .push(channel, packet.index, packet.values, now)
                .map(|b| (Modality::Ppg, b));
        }
        if uuid == ACCELEROMETER_CHARACTERISTIC {
            let packet = parse_accelerometer(data)?;
            let batch = imu_batch(&mut self.acc, packet.index, packet.values, ACC_FREQUENCY, now);
            return Some((Modality::Acc, batch));
        }
        if uuid == GYROSCOPE_CHARACTERISTIC {
            let packet = parse_gyroscope(data)?;
            let batch = imu_batch(&mut self.gyro, packet.index, packet.values, GYRO_FREQUENCY, now);
            return Some((Modality::Gyro, batch));
        }
        None
    }
}
