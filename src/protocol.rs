//! GATT UUIDs, sampling constants, and control-command framing for Muse headsets.
//!
//! All UUIDs belong to the Muse vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.

use uuid::Uuid;

use crate::types::Modality;

// ── Product identification ───────────────────────────────────────────────────

/// Substring every Muse headset carries in its advertised name
/// (`"Muse-AB12"`, `"MuseS-4F2A"`, …).
pub const PRODUCT_IDENTIFIER: &str = "Muse";

/// Manufacturer tag written into every published stream description.
pub const MANUFACTURER: &str = "Muse";

// ── Characteristics ───────────────────────────────────────────────────────────

/// Bidirectional control channel.
///
/// The host writes length-prefixed ASCII commands (e.g. `"d"`, `"h"`, `"p21"`)
/// and receives JSON status fragments in response notifications.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// Gyroscope characteristic: 3 × XYZ samples per notification at ~52 Hz.
pub const GYROSCOPE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0009_4c4d_454d_96be_f03bac821358);

/// Accelerometer characteristic: 3 × XYZ samples per notification at ~52 Hz.
pub const ACCELEROMETER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e000a_4c4d_454d_96be_f03bac821358);

/// EEG per-channel characteristics, indexed by electrode:
///
/// | Index | UUID suffix | Electrode |
/// |-------|-------------|-----------|
/// | 0     | 0003        | TP9       |
/// | 1     | 0004        | AF7       |
/// | 2     | 0005        | AF8       |
/// | 3     | 0006        | TP10      |
/// | 4     | 0007        | Right AUX |
pub const EEG_CHARACTERISTICS: [Uuid; 5] = [
    Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358), // TP9
    Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358), // AF7
    Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358), // AF8
    Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358), // TP10
    Uuid::from_u128(0x273e0007_4c4d_454d_96be_f03bac821358), // AUX
];

/// PPG (optical heart-rate) characteristics, indexed by channel:
///
/// | Index | UUID suffix | Channel    |
/// |-------|-------------|------------|
/// | 0     | 000f        | ambient    |
/// | 1     | 0010        | infrared   |
/// | 2     | 0011        | red        |
///
/// Available on Muse 2 and Muse S only.
pub const PPG_CHARACTERISTICS: [Uuid; 3] = [
    Uuid::from_u128(0x273e000f_4c4d_454d_96be_f03bac821358), // ambient
    Uuid::from_u128(0x273e0010_4c4d_454d_96be_f03bac821358), // infrared
    Uuid::from_u128(0x273e0011_4c4d_454d_96be_f03bac821358), // red
];

/// Sensor characteristics to subscribe to for `modality`.
pub fn characteristics(modality: Modality) -> &'static [Uuid] {
    match modality {
        Modality::Eeg => &EEG_CHARACTERISTICS,
        Modality::Ppg => &PPG_CHARACTERISTICS,
        Modality::Acc => &[ACCELEROMETER_CHARACTERISTIC],
        Modality::Gyro => &[GYROSCOPE_CHARACTERISTIC],
    }
}

// ── Sampling constants ────────────────────────────────────────────────────────

/// EEG sample rate in Hz (256 samples per second per channel).
pub const EEG_FREQUENCY: f64 = 256.0;

/// Number of EEG voltage samples packed into one BLE notification.
///
/// At 256 Hz, 12 samples represent ≈ 46.9 ms of signal per packet.
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// PPG sample rate in Hz (64 samples per second per optical channel).
pub const PPG_FREQUENCY: f64 = 64.0;

/// Number of raw 24-bit PPG values packed into one BLE notification.
pub const PPG_SAMPLES_PER_READING: usize = 6;

/// Accelerometer sample rate in Hz.
pub const ACC_FREQUENCY: f64 = 52.0;

/// Gyroscope sample rate in Hz.
pub const GYRO_FREQUENCY: f64 = 52.0;

/// XYZ samples carried by one accelerometer or gyroscope notification.
pub const IMU_SAMPLES_PER_READING: usize = 3;

// ── Channel counts ────────────────────────────────────────────────────────────

pub const EEG_CHANNEL_COUNT: usize = 5;
pub const PPG_CHANNEL_COUNT: usize = 3;
pub const ACC_CHANNEL_COUNT: usize = 3;
pub const GYRO_CHANNEL_COUNT: usize = 3;

/// Samples the bus should buffer per chunk, per modality.
pub const EEG_CHUNK: usize = 12;
pub const PPG_CHUNK: usize = 6;
pub const ACC_CHUNK: usize = 1;
pub const GYRO_CHUNK: usize = 1;

// ── Human-readable labels ─────────────────────────────────────────────────────

/// Electrode names in [`EEG_CHARACTERISTICS`] index order.
pub const EEG_CHANNEL_NAMES: [&str; 5] = ["TP9", "AF7", "AF8", "TP10", "Right AUX"];

/// Published PPG channel labels in [`PPG_CHARACTERISTICS`] index order.
pub const PPG_CHANNEL_NAMES: [&str; 3] = ["PPG1", "PPG2", "PPG3"];

/// Axis labels shared by the accelerometer and gyroscope streams.
pub const IMU_AXIS_NAMES: [&str; 3] = ["X", "Y", "Z"];

// ── Presets ───────────────────────────────────────────────────────────────────

/// Preset used when PPG is requested (EEG + PPG).
pub const PRESET_WITH_PPG: &str = "p50";

/// Preset used otherwise (EEG only, AUX unused).
pub const PRESET_DEFAULT: &str = "p21";

// ── Control commands ──────────────────────────────────────────────────────────

/// Encode a text command for the Muse control characteristic.
///
/// The Muse expects a length-prefixed frame:
/// ```text
/// byte 0     : payload length (= command.len() + 1 for the trailing '\n')
/// bytes 1..N : ASCII command string
/// byte N+1   : '\n' terminator
/// ```
///
/// # Example
///
/// ```
/// # use muse_lsl::protocol::encode_command;
/// assert_eq!(encode_command("d"), &[0x02, b'd', b'\n']);
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 2);
    bytes.push((cmd.len() + 1) as u8);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Decode a raw BLE notification from the control characteristic into a string.
///
/// Same length-prefix framing as [`encode_command`]; returns an empty string
/// for an empty notification.
pub fn decode_response(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = bytes[0] as usize;
    let end = (1 + len).min(bytes.len());
    String::from_utf8_lossy(&bytes[1..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_preset_command() {
        assert_eq!(encode_command("p21"), b"\x04p21\n".to_vec());
    }

    #[test]
    fn decode_truncates_to_declared_length() {
        let raw = [3u8, b'{', b'"', b'r', b'x', b'x'];
        assert_eq!(decode_response(&raw), "{\"r");
        assert_eq!(decode_response(&[]), "");
    }

    #[test]
    fn every_modality_has_characteristics() {
        assert_eq!(characteristics(Modality::Eeg).len(), 5);
        assert_eq!(characteristics(Modality::Ppg).len(), 3);
        assert_eq!(characteristics(Modality::Acc), &[ACCELEROMETER_CHARACTERISTIC]);
        assert_eq!(characteristics(Modality::Gyro), &[GYROSCOPE_CHARACTERISTIC]);
    }

    #[test]
    fn label_tables_match_channel_counts() {
        assert_eq!(EEG_CHANNEL_NAMES.len(), EEG_CHANNEL_COUNT);
        assert_eq!(PPG_CHANNEL_NAMES.len(), PPG_CHANNEL_COUNT);
        assert_eq!(IMU_AXIS_NAMES.len(), ACC_CHANNEL_COUNT);
        assert_eq!(IMU_AXIS_NAMES.len(), GYRO_CHANNEL_COUNT);
    }
}
