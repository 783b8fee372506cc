//! Binary decoders for Classic Muse BLE notification payloads.
//!
//! Pure functions, safe to call from the notification task. Every sensor
//! notification starts with a big-endian `u16` packet index:
//!
//! | Function | Sensor | Payload after the index |
//! |---|---|---|
//! | [`parse_eeg_packet`] | EEG | 12-bit BE packed, 12 samples, 0.48828125 µV/LSB |
//! | [`parse_ppg_packet`] | PPG | 24-bit BE unsigned, 6 samples |
//! | [`parse_accelerometer`] | ACC | 3 × i16 BE XYZ, 0.0000610352 g/LSB |
//! | [`parse_gyroscope`] | GYRO | 3 × i16 BE XYZ, 0.0074768 °/s/LSB |

/// Accelerometer scale (±2 G over a signed 16-bit range).
const ACC_SCALE: f32 = 0.0000610352;

/// Gyroscope scale (±245 dps over a signed 16-bit range).
const GYRO_SCALE: f32 = 0.0074768;

/// A decoded notification: packet index plus per-sample values.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<T> {
    pub index: u16,
    pub values: T,
}

fn packet_index(data: &[u8]) -> Option<u16> {
    (data.len() >= 2).then(|| u16::from_be_bytes([data[0], data[1]]))
}

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Decode a packed 12-bit unsigned array (big-endian, 3 bytes → 2 samples).
///
/// ```text
/// [AA BB CC] → sample0 = (AA << 4) | (BB >> 4)
///              sample1 = ((BB & 0x0F) << 8) | CC
/// ```
///
/// Trailing bytes that do not complete a sample are ignored.
pub fn decode_unsigned_12bit(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(data.len() * 2 / 3);
    for group in data.chunks(3) {
        if group.len() >= 2 {
            out.push(((group[0] as u16) << 4) | ((group[1] as u16) >> 4));
        }
        if group.len() == 3 {
            out.push(((group[1] as u16 & 0x0F) << 8) | group[2] as u16);
        }
    }
    out
}

/// Decode an EEG notification into µV.
///
/// `µV = (raw − 2048) × 0.48828125`
///
/// Returns `None` when the notification is too short to carry an index.
pub fn parse_eeg_packet(data: &[u8]) -> Option<Packet<Vec<f32>>> {
    let index = packet_index(data)?;
    let values = decode_unsigned_12bit(&data[2..])
        .into_iter()
        .map(|n| 0.48828125 * (n as f32 - 2048.0))
        .collect();
    Some(Packet { index, values })
}

// ── PPG ──────────────────────────────────────────────────────────────────────

/// Decode a 24-bit unsigned big-endian array (3 bytes per sample).
pub fn decode_unsigned_24bit(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(3)
        .map(|c| ((c[0] as u32) << 16) | ((c[1] as u32) << 8) | (c[2] as u32))
        .collect()
}

/// Decode a PPG notification. Values stay raw ADC counts, widened to `f32`.
pub fn parse_ppg_packet(data: &[u8]) -> Option<Packet<Vec<f32>>> {
    let index = packet_index(data)?;
    let values = decode_unsigned_24bit(&data[2..])
        .into_iter()
        .map(|v| v as f32)
        .collect();
    Some(Packet { index, values })
}

// ── IMU ───────────────────────────────────────────────────────────────────────

/// Axis-major IMU block: `axes[axis][sample]` for X, Y, Z.
pub type ImuAxes = [[f32; 3]; 3];

/// Accelerometer and gyroscope share a layout: index, then three XYZ
/// samples of big-endian `i16` at byte offsets 2, 8 and 14.
fn parse_imu_packet(data: &[u8], scale: f32) -> Option<Packet<ImuAxes>> {
    if data.len() < 20 {
        return None;
    }
    let index = packet_index(data)?;
    let read = |off: usize| scale * i16::from_be_bytes([data[off], data[off + 1]]) as f32;

    let mut axes = [[0.0f32; 3]; 3];
    for (sample, off) in [2usize, 8, 14].into_iter().enumerate() {
        for (axis, row) in axes.iter_mut().enumerate() {
            row[sample] = read(off + axis * 2);
        }
    }
    Some(Packet { index, values: axes })
}

/// Decode an accelerometer notification into g.
pub fn parse_accelerometer(data: &[u8]) -> Option<Packet<ImuAxes>> {
    parse_imu_packet(data, ACC_SCALE)
}

/// Decode a gyroscope notification into °/s.
pub fn parse_gyroscope(data: &[u8]) -> Option<Packet<ImuAxes>> {
    parse_imu_packet(data, GYRO_SCALE)
}

// ── Control responses ─────────────────────────────────────────────────────────

/// Reassembles control-channel fragments into complete JSON objects.
///
/// Replies to `s` and `v1` arrive split over several notifications
/// (`{"hn":`, `"Muse-AB12"`, `}`). Characters before the first `{` are
/// dropped.
///
/// ```
/// # use muse_lsl::parse::ControlAccumulator;
/// let mut acc = ControlAccumulator::default();
/// assert!(acc.push(r#"{"fw":"3.4."#).is_none());
/// assert_eq!(acc.push(r#"5"}"#).unwrap(), r#"{"fw":"3.4.5"}"#);
/// ```
#[derive(Debug, Default)]
pub struct ControlAccumulator {
    buffer: String,
    depth: usize,
}

impl ControlAccumulator {
    /// Append a fragment; returns the finished object once its closing brace
    /// arrives.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        for ch in fragment.chars() {
            match ch {
                '{' => {
                    if self.depth == 0 {
                        self.buffer.clear();
                    }
                    self.depth += 1;
                    self.buffer.push(ch);
                }
                '}' if self.depth > 0 => {
                    self.buffer.push(ch);
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(std::mem::take(&mut self.buffer));
                    }
                }
                _ if self.depth > 0 => self.buffer.push(ch),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_12bit_pairs() {
        assert_eq!(decode_unsigned_12bit(&[0xAB, 0xCD, 0xEF]), vec![0xABC, 0xDEF]);
        assert_eq!(decode_unsigned_12bit(&[0x80, 0x08]), vec![0x800]);
    }

    #[test]
    fn eeg_midscale_is_zero_microvolts() {
        // index 7, then 0x800 0x800
        let packet = parse_eeg_packet(&[0x00, 0x07, 0x80, 0x08, 0x00]).unwrap();
        assert_eq!(packet.index, 7);
        assert_eq!(packet.values, vec![0.0, 0.0]);
    }

    #[test]
    fn eeg_full_notification_has_twelve_samples() {
        let mut data = vec![0x01, 0x00];
        data.extend(std::iter::repeat(0xFF).take(18));
        let packet = parse_eeg_packet(&data).unwrap();
        assert_eq!(packet.index, 256);
        assert_eq!(packet.values.len(), 12);
        assert!((packet.values[0] - 999.5117).abs() < 1e-3);
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(parse_eeg_packet(&[0x01]).is_none());
        assert!(parse_accelerometer(&[0u8; 19]).is_none());
    }

    #[test]
    fn ppg_values_are_24bit() {
        let packet = parse_ppg_packet(&[0, 1, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(packet.values, vec![0x010203 as f32]);
    }

    #[test]
    fn imu_is_axis_major() {
        let mut data = vec![0u8; 20];
        // sample 1 (offset 8): x = 1, y = 2, z = 3
        data[8..14].copy_from_slice(&[0, 1, 0, 2, 0, 3]);
        let packet = parse_gyroscope(&data).unwrap();
        assert_eq!(packet.values[0][1], GYRO_SCALE);
        assert_eq!(packet.values[1][1], 2.0 * GYRO_SCALE);
        assert_eq!(packet.values[2][1], 3.0 * GYRO_SCALE);
        assert_eq!(packet.values[0][0], 0.0);
    }

    #[test]
    fn accumulator_skips_leading_garbage() {
        let mut acc = ControlAccumulator::default();
        assert!(acc.push("rc\":0}").is_none());
        assert_eq!(acc.push("{\"rc\":0}").as_deref(), Some("{\"rc\":0}"));
    }
}
