//! Stream configuration, loaded from an optional JSON file.
//!
//! Every field has a default, so `{}` and a missing file both give the
//! stock EEG-only stream on the `auto` backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assemble::Clock;
use crate::backend::{BackendKind, BackendOptions, SessionOptions};
use crate::error::Result;
use crate::locator::LIST_SCAN_TIMEOUT;
use crate::protocol::PRODUCT_IDENTIFIER;
use crate::session::StreamRequest;
use crate::supervisor::{SupervisorPolicy, AUTO_DISCONNECT_DELAY, POLL_INTERVAL, SILENT_CONNECT_LIMIT};
use crate::types::ModalitySet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Connect to this address and skip discovery.
    pub address: Option<String>,
    /// Exact device name to look for when no address is given.
    pub name: Option<String>,
    pub backend: BackendKind,
    /// `gatt` interface (`hci0`) or `bgapi` serial port.
    pub interface: Option<String>,

    pub eeg: bool,
    pub ppg: bool,
    pub acc: bool,
    pub gyro: bool,

    /// Headset preset; `p50` with PPG, `p21` otherwise when unset.
    pub preset: Option<String>,
    pub disable_light: bool,
    /// `wall` (Unix time) or `bus` (monotonic) sample timestamps.
    pub clock: Clock,

    /// Total connection attempts.
    pub retries: u32,
    pub scan_timeout_secs: f64,
    pub stale_after_secs: f64,
    pub silent_limit_secs: u64,
    pub poll_interval_ms: u64,

    /// Substring a discovered name must contain.
    pub name_prefix: String,

    /// File the JSON-lines bus writes to; stdout when unset.
    pub output: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            backend: BackendKind::Auto,
            interface: None,
            eeg: true,
            ppg: false,
            acc: false,
            gyro: false,
            preset: None,
            disable_light: false,
            clock: Clock::Wall,
            retries: 1,
            scan_timeout_secs: LIST_SCAN_TIMEOUT.as_secs_f64(),
            stale_after_secs: AUTO_DISCONNECT_DELAY.as_secs_f64(),
            silent_limit_secs: SILENT_CONNECT_LIMIT.as_secs(),
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            name_prefix: PRODUCT_IDENTIFIER.to_string(),
            output: None,
        }
    }
}

impl StreamConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn modalities(&self) -> ModalitySet {
        ModalitySet {
            eeg: self.eeg,
            ppg: self.ppg,
            acc: self.acc,
            gyro: self.gyro,
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            interface: self.interface.clone(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            preset: self.preset.clone(),
            disable_light: self.disable_light,
            clock: self.clock,
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        secs(self.scan_timeout_secs)
    }

    pub fn policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            stale_after: secs(self.stale_after_secs),
            silent_limit: Duration::from_secs(self.silent_limit_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }

    pub fn request(&self) -> StreamRequest {
        StreamRequest {
            address: self.address.clone(),
            name: self.name.clone(),
            backend: self.backend,
            modalities: self.modalities(),
            options: self.session_options(),
            retries: self.retries,
            scan_timeout: self.scan_timeout(),
            policy: self.policy(),
        }
    }
}

/// Negative and non-finite values read as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
