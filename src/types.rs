use std::fmt;

use serde::{Deserialize, Serialize};

/// A Muse headset seen during discovery.
///
/// Only produced by [`crate::locator::DeviceLocator`]; nothing keeps a
/// descriptor beyond the discovery call that returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Advertised device name (e.g. `"Muse-AB12"`).
    pub name: String,
    /// Bluetooth address, `AA:BB:CC:DD:EE:FF` (or hyphen separated).
    ///
    /// On macOS, where CoreBluetooth hides MAC addresses, this holds the
    /// platform peripheral UUID instead.
    pub address: String,
}

/// One sensor data type published by the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Eeg,
    Ppg,
    Acc,
    Gyro,
}

impl Modality {
    pub const ALL: [Modality; 4] = [Modality::Eeg, Modality::Ppg, Modality::Acc, Modality::Gyro];

    /// Stream type tag (`"EEG"`, `"PPG"`, `"ACC"`, `"GYRO"`).
    pub fn stream_type(self) -> &'static str {
        match self {
            Modality::Eeg => "EEG",
            Modality::Ppg => "PPG",
            Modality::Acc => "ACC",
            Modality::Gyro => "GYRO",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_type())
    }
}

/// Which modalities a stream request enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalitySet {
    pub eeg: bool,
    pub ppg: bool,
    pub acc: bool,
    pub gyro: bool,
}

impl ModalitySet {
    pub fn none() -> Self {
        Self {
            eeg: false,
            ppg: false,
            acc: false,
            gyro: false,
        }
    }

    pub fn contains(&self, modality: Modality) -> bool {
        match modality {
            Modality::Eeg => self.eeg,
            Modality::Ppg => self.ppg,
            Modality::Acc => self.acc,
            Modality::Gyro => self.gyro,
        }
    }

    pub fn with(mut self, modality: Modality) -> Self {
        match modality {
            Modality::Eeg => self.eeg = true,
            Modality::Ppg => self.ppg = true,
            Modality::Acc => self.acc = true,
            Modality::Gyro => self.gyro = true,
        }
        self
    }

    /// Enabled modalities in publishing order (EEG, PPG, ACC, GYRO).
    pub fn iter(&self) -> impl Iterator<Item = Modality> + '_ {
        Modality::ALL.into_iter().filter(|m| self.contains(*m))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// EEG only, matching the streamer's defaults.
impl Default for ModalitySet {
    fn default() -> Self {
        Self::none().with(Modality::Eeg)
    }
}

/// Decoded sensor data handed from a session to a sample callback.
///
/// The shape is decided once, where the notification is decoded, so the
/// router never has to guess it.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBatch {
    /// `rows[channel][i]`, one column per sample.
    ///
    /// `timestamps[i]` (seconds since Unix epoch) stamps column `i`; the
    /// vector may be shorter than the column count, or empty, in which case
    /// the remaining columns carry no explicit timestamp.
    Matrix {
        rows: Vec<Vec<f32>>,
        timestamps: Vec<f64>,
    },
    /// An ordered sequence of complete samples, stamped positionally.
    Samples {
        samples: Vec<Vec<f32>>,
        timestamps: Vec<f64>,
    },
    /// A single sample.
    Single {
        sample: Vec<f32>,
        timestamp: Option<f64>,
    },
}

impl SampleBatch {
    /// Number of samples the batch describes, as far as its shape allows.
    pub fn len(&self) -> usize {
        match self {
            SampleBatch::Matrix { rows, .. } => rows.first().map_or(0, Vec::len),
            SampleBatch::Samples { samples, .. } => samples.len(),
            SampleBatch::Single { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_streams_eeg_only() {
        let set = ModalitySet::default();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Modality::Eeg]);
        assert!(!set.is_empty());
    }

    #[test]
    fn empty_set_is_detected() {
        assert!(ModalitySet::none().is_empty());
        assert!(!ModalitySet::none().with(Modality::Gyro).is_empty());
    }

    #[test]
    fn matrix_len_counts_columns() {
        let batch = SampleBatch::Matrix {
            rows: vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
            timestamps: vec![],
        };
        assert_eq!(batch.len(), 3);
    }
}
