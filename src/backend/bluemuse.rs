//! Control of the external BlueMuse bridge through its `bluemuse:` URI scheme.
//!
//! BlueMuse owns discovery, the BLE link and the published streams. This side
//! only toggles its settings and tells it which headset to start.

use std::process::Command;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::types::{Modality, ModalitySet};

/// Opens a URI with the host's registered handler.
pub trait UriLauncher: Send + Sync {
    fn launch(&self, uri: &str) -> Result<()>;
}

/// `cmd /C start` on Windows. BlueMuse exists nowhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellLauncher;

impl UriLauncher for ShellLauncher {
    fn launch(&self, uri: &str) -> Result<()> {
        if !cfg!(target_os = "windows") {
            return Err(Error::UnsupportedBackend("bluemuse".into()));
        }
        debug!("launching {uri}");
        // The empty argument is the window title `start` expects first.
        let status = Command::new("cmd").args(["/C", "start", "", uri]).status()?;
        if !status.success() {
            debug!("`start {uri}` exited with {status}");
        }
        Ok(())
    }
}

/// Setting key BlueMuse uses for each modality's stream toggle.
fn setting_key(modality: Modality) -> &'static str {
    match modality {
        Modality::Eeg => "eeg_enabled",
        Modality::Ppg => "ppg_enabled",
        Modality::Acc => "accelerometer_enabled",
        Modality::Gyro => "gyroscope_enabled",
    }
}

pub fn setting_uri(key: &str, enabled: bool) -> String {
    format!("bluemuse://setting?key={key}!value={enabled}")
}

/// Start URI for a device address or name, or for the first device found.
pub fn start_uri(target: Option<&str>) -> String {
    match target {
        Some(device) => format!("bluemuse://start?addresses={device}"),
        None => "bluemuse://start?streamfirst=true".to_string(),
    }
}

#[derive(Clone)]
pub struct BlueMuse {
    launcher: Arc<dyn UriLauncher>,
}

impl BlueMuse {
    pub fn new(launcher: Arc<dyn UriLauncher>) -> Self {
        Self { launcher }
    }

    /// Bring up the BlueMuse window.
    pub fn open(&self) -> Result<()> {
        self.launcher.launch("bluemuse:")
    }

    pub fn set_setting(&self, key: &str, enabled: bool) -> Result<()> {
        self.launcher.launch(&setting_uri(key, enabled))
    }

    /// Toggle every stream type to match `modalities`.
    pub fn configure(&self, modalities: &ModalitySet) -> Result<()> {
        for modality in Modality::ALL {
            self.set_setting(setting_key(modality), modalities.contains(modality))?;
        }
        Ok(())
    }

    /// Start streaming from `address`, else `name`, else the first device.
    pub fn target(&self, address: Option<&str>, name: Option<&str>) -> Result<()> {
        self.launcher.launch(&start_uri(address.or(name)))
    }
}
