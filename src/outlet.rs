//! The sample bus side: stream descriptions, outlets, and the channel set
//! a session publishes through.
//!
//! [`DataBus`] and [`Outlet`] are the seam to the distribution bus. The crate
//! ships [`JsonLinesBus`], which writes one JSON object per line:
//!
//! ```text
//! {"event":"open","info":{"name":"Muse","type":"EEG",...}}
//! {"event":"sample","source_id":"Muse00:55:DA:B0:12:34","type":"EEG","timestamp":1718000000.12,"sample":[...]}
//! {"event":"close","source_id":"Muse00:55:DA:B0:12:34","type":"EEG","pushed":2560}
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::Serialize;
use serde_json::json;

use crate::assemble::Clock;
use crate::error::{Error, Result};
use crate::protocol::{
    ACC_CHANNEL_COUNT, ACC_CHUNK, ACC_FREQUENCY, EEG_CHANNEL_COUNT, EEG_CHANNEL_NAMES, EEG_CHUNK,
    EEG_FREQUENCY, GYRO_CHANNEL_COUNT, GYRO_CHUNK, GYRO_FREQUENCY, IMU_AXIS_NAMES, MANUFACTURER,
    PPG_CHANNEL_COUNT, PPG_CHANNEL_NAMES, PPG_CHUNK, PPG_FREQUENCY,
};
use crate::types::{Modality, ModalitySet};

// ── Stream description ────────────────────────────────────────────────────────

/// Per-channel annotation published with a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelAnnotation {
    pub label: String,
    pub unit: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Everything a bus needs to open an output channel.
///
/// Channel count and nominal rate are fixed for the channel's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
    pub channel_format: String,
    pub source_id: String,
    pub manufacturer: String,
    pub chunk_size: usize,
    pub channels: Vec<ChannelAnnotation>,
}

impl StreamInfo {
    /// The fixed description for `modality` on the headset at `address`.
    pub fn for_modality(modality: Modality, address: &str) -> Self {
        let (labels, unit, kind, rate, chunk): (&[&str], &str, &str, f64, usize) = match modality {
            Modality::Eeg => (&EEG_CHANNEL_NAMES[..], "microvolts", "EEG", EEG_FREQUENCY, EEG_CHUNK),
            Modality::Ppg => (&PPG_CHANNEL_NAMES[..], "mmHg", "PPG", PPG_FREQUENCY, PPG_CHUNK),
            Modality::Acc => (&IMU_AXIS_NAMES[..], "g", "accelerometer", ACC_FREQUENCY, ACC_CHUNK),
            Modality::Gyro => (&IMU_AXIS_NAMES[..], "dps", "gyroscope", GYRO_FREQUENCY, GYRO_CHUNK),
        };
        let channel_count = match modality {
            Modality::Eeg => EEG_CHANNEL_COUNT,
            Modality::Ppg => PPG_CHANNEL_COUNT,
            Modality::Acc => ACC_CHANNEL_COUNT,
            Modality::Gyro => GYRO_CHANNEL_COUNT,
        };

        Self {
            name: MANUFACTURER.to_string(),
            stream_type: modality.stream_type().to_string(),
            channel_count,
            nominal_srate: rate,
            channel_format: "float32".to_string(),
            source_id: format!("Muse{address}"),
            manufacturer: MANUFACTURER.to_string(),
            chunk_size: chunk,
            channels: labels
                .iter()
                .map(|label| ChannelAnnotation {
                    label: label.to_string(),
                    unit: unit.to_string(),
                    kind: kind.to_string(),
                })
                .collect(),
        }
    }
}

// ── Bus seam ──────────────────────────────────────────────────────────────────

/// One open output channel on the bus.
pub trait Outlet: Send {
    /// Publish one sample. `None` lets the bus stamp it with its own clock.
    fn push_sample(&mut self, sample: &[f32], timestamp: Option<f64>) -> Result<()>;

    /// Release the channel. Pushes after close fail.
    fn close(&mut self) -> Result<()>;
}

/// Opens output channels.
pub trait DataBus: Send + Sync {
    fn open_stream(&self, info: &StreamInfo) -> Result<Box<dyn Outlet>>;
}

/// An outlet shared between the session's callback and the controller.
pub type SharedOutlet = Arc<Mutex<Box<dyn Outlet>>>;

// ── Channel set ───────────────────────────────────────────────────────────────

/// The open output channels of one session, keyed by modality.
///
/// Closed exactly once: by [`ChannelSet::close`], or on drop if that never
/// ran.
pub struct ChannelSet {
    outlets: BTreeMap<Modality, SharedOutlet>,
    closed: bool,
}

impl ChannelSet {
    /// Open one channel per enabled modality. If any open fails, channels
    /// opened so far are closed before the error is returned.
    pub fn open(bus: &dyn DataBus, modalities: &ModalitySet, address: &str) -> Result<Self> {
        let mut set = Self {
            outlets: BTreeMap::new(),
            closed: false,
        };
        for modality in modalities.iter() {
            let info = StreamInfo::for_modality(modality, address);
            let outlet = bus.open_stream(&info)?;
            debug!(
                "opened {} outlet: {} ch @ {} Hz",
                modality, info.channel_count, info.nominal_srate
            );
            set.outlets.insert(modality, Arc::new(Mutex::new(outlet)));
        }
        Ok(set)
    }

    pub fn get(&self, modality: Modality) -> Option<SharedOutlet> {
        self.outlets.get(&modality).cloned()
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.outlets.keys().copied()
    }

    /// Close every channel. Later calls do nothing.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        for (modality, outlet) in &self.outlets {
            let result = match outlet.lock() {
                Ok(mut o) => o.close(),
                Err(poisoned) => poisoned.into_inner().close(),
            };
            if let Err(e) = result {
                warn!("closing {modality} outlet: {e}");
            }
        }
    }
}

impl Drop for ChannelSet {
    fn drop(&mut self) {
        self.close();
    }
}

// ── JSON lines bus ────────────────────────────────────────────────────────────

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A [`DataBus`] that serialises streams as newline-delimited JSON.
#[derive(Clone)]
pub struct JsonLinesBus {
    writer: SharedWriter,
    clock: Clock,
}

impl JsonLinesBus {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            clock: Clock::default(),
        }
    }

    /// Clock used to stamp samples pushed without a timestamp.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

fn write_line(writer: &SharedWriter, value: &serde_json::Value) -> Result<()> {
    let mut w = writer
        .lock()
        .map_err(|_| Error::Bus("writer lock poisoned".into()))?;
    serde_json::to_writer(&mut *w, value).map_err(|e| Error::Bus(e.to_string()))?;
    w.write_all(b"\n")?;
    Ok(())
}

impl DataBus for JsonLinesBus {
    fn open_stream(&self, info: &StreamInfo) -> Result<Box<dyn Outlet>> {
        write_line(&self.writer, &json!({ "event": "open", "info": info }))?;
        Ok(Box::new(JsonLinesOutlet {
            writer: Arc::clone(&self.writer),
            source_id: info.source_id.clone(),
            stream_type: info.stream_type.clone(),
            channel_count: info.channel_count,
            clock: self.clock,
            pushed: 0,
            open: true,
        }))
    }
}

struct JsonLinesOutlet {
    writer: SharedWriter,
    source_id: String,
    stream_type: String,
    channel_count: usize,
    clock: Clock,
    pushed: u64,
    open: bool,
}

impl Outlet for JsonLinesOutlet {
    fn push_sample(&mut self, sample: &[f32], timestamp: Option<f64>) -> Result<()> {
        if !self.open {
            return Err(Error::Bus(format!("{} outlet is closed", self.stream_type)));
        }
        if sample.len() != self.channel_count {
            return Err(Error::Bus(format!(
                "{} outlet expects {} channels, got {}",
                self.stream_type,
                self.channel_count,
                sample.len()
            )));
        }
        write_line(
            &self.writer,
            &json!({
                "event": "sample",
                "source_id": self.source_id,
                "type": self.stream_type,
                "timestamp": timestamp.unwrap_or_else(|| self.clock.now()),
                "sample": sample,
            }),
        )?;
        self.pushed += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        write_line(
            &self.writer,
            &json!({
                "event": "close",
                "source_id": self.source_id,
                "type": self.stream_type,
                "pushed": self.pushed,
            }),
        )
    }
}
