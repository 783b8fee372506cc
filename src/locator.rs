//! Finding Muse headsets: an in-process BLE scan, or `bluetoothctl` when the
//! host has it.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::backend::{BackendKind, BleBackend, Strategy};
use crate::error::{Error, Result};
use crate::protocol::PRODUCT_IDENTIFIER;
use crate::status::Status;
use crate::types::DeviceDescriptor;

/// How long a listing scans for advertisements.
pub const LIST_SCAN_TIMEOUT: Duration = Duration::from_millis(10_500);

const SCAN_OFF_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DEVICES_TIMEOUT: Duration = Duration::from_secs(10);

// ── bluetoothctl ──────────────────────────────────────────────────────────────

/// The three `bluetoothctl` invocations discovery needs.
#[async_trait]
pub trait BluetoothCtl: Send {
    /// Start a background `scan on`.
    async fn scan_on(&mut self) -> Result<()>;

    /// `scan off`, then end the background scan.
    async fn scan_off(&mut self, timeout: Duration) -> Result<()>;

    /// Raw `devices` output.
    async fn devices(&mut self, timeout: Duration) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct SystemBluetoothCtl {
    scan: Option<Child>,
}

impl SystemBluetoothCtl {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(args: &[&str], limit: Duration) -> Result<String> {
        let output = Command::new("bluetoothctl")
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(limit, output).await.map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("bluetoothctl {} timed out after {limit:?}", args.join(" ")),
            )
        })??;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl BluetoothCtl for SystemBluetoothCtl {
    async fn scan_on(&mut self) -> Result<()> {
        let child = Command::new("bluetoothctl")
            .args(["scan", "on"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.scan = Some(child);
        Ok(())
    }

    async fn scan_off(&mut self, limit: Duration) -> Result<()> {
        let stopped = Self::run(&["scan", "off"], limit).await.map(|_| ());
        if let Err(e) = &stopped {
            debug!("bluetoothctl scan off: {e}");
        }

        if let Some(mut child) = self.scan.take() {
            if timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                debug!("bluetoothctl scan still running, killing it");
                child.kill().await?;
            }
        }
        stopped
    }

    async fn devices(&mut self, limit: Duration) -> Result<String> {
        Self::run(&["devices"], limit).await
    }
}

/// Muse descriptors from `bluetoothctl devices` output.
///
/// Lines look like `Device 00:55:DA:B0:12:34 Muse-1234`. Lines that mention
/// `product` without both a name and an address are skipped.
pub fn parse_bluetoothctl_devices(output: &str, product: &str) -> Vec<DeviceDescriptor> {
    let (Ok(name_pattern), Ok(address_pattern)) = (
        Regex::new(&format!(r"{}[^\s]*", regex::escape(product))),
        Regex::new(r"(?i)([0-9A-F]{2}[:-]){5}[0-9A-F]{2}"),
    ) else {
        return Vec::new();
    };
    output
        .lines()
        .filter(|line| line.contains(product))
        .filter_map(|line| {
            let name = name_pattern.find(line)?;
            let address = address_pattern.find(line)?;
            Some(DeviceDescriptor {
                name: name.as_str().to_string(),
                address: address.as_str().to_string(),
            })
        })
        .collect()
}

// ── Locator ───────────────────────────────────────────────────────────────────

pub struct DeviceLocator {
    ctl: Box<dyn BluetoothCtl>,
    product: String,
    status: Status,
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::new(Box::new(SystemBluetoothCtl::new()))
    }
}

impl DeviceLocator {
    pub fn new(ctl: Box<dyn BluetoothCtl>) -> Self {
        Self {
            ctl,
            product: PRODUCT_IDENTIFIER.to_string(),
            status: Status::default(),
        }
    }

    /// Only names containing `product` are reported.
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    /// Where progress lines go. stderr by default.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// List nearby headsets. `Ok(None)` when BlueMuse owns discovery.
    pub async fn discover(
        &mut self,
        strategy: &mut Strategy,
        scan_timeout: Duration,
    ) -> Result<Option<Vec<DeviceDescriptor>>> {
        let muses = match strategy {
            Strategy::BlueMuse(bridge) => {
                self.status.line("Starting BlueMuse, see BlueMuse window for interactive list of devices.");
                bridge.open()?;
                return Ok(None);
            }
            Strategy::BluetoothCtl => {
                self.status.line("Backend was 'auto' and bluetoothctl was found, using it to list Muses...");
                self.list_with_bluetoothctl(scan_timeout).await
            }
            Strategy::Adapter(backend) => {
                self.status.line("Searching for Muses, this may take up to 10 seconds...");
                match scan_with(backend.as_mut(), scan_timeout).await {
                    Ok(devices) => devices
                        .into_iter()
                        .filter(|d| d.name.contains(&self.product))
                        .collect(),
                    Err(Error::ScanBackend(e)) if backend.kind() == BackendKind::Gatt => {
                        warn!("gatt scan failed: {e}");
                        self.status.line("BLE adapter failed to scan for devices. Trying with bluetoothctl.");
                        self.list_with_bluetoothctl(scan_timeout).await
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.report(&muses);
        Ok(Some(muses))
    }

    /// The headset named `name` exactly, or the first one found.
    pub async fn find(
        &mut self,
        name: Option<&str>,
        strategy: &mut Strategy,
        scan_timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>> {
        let Some(muses) = self.discover(strategy, scan_timeout).await? else {
            return Ok(None);
        };
        Ok(match name {
            Some(name) => muses.into_iter().find(|m| m.name == name),
            None => muses.into_iter().next(),
        })
    }

    /// Scan errors are logged and never abort the listing.
    async fn list_with_bluetoothctl(&mut self, scan_timeout: Duration) -> Vec<DeviceDescriptor> {
        self.status.line("Searching for Muses, this may take up to 10 seconds...");
        if let Err(e) = self.ctl.scan_on().await {
            warn!("bluetoothctl scan error (continuing anyway): {e}");
        }
        sleep(scan_timeout).await;
        if let Err(e) = self.ctl.scan_off(SCAN_OFF_TIMEOUT).await {
            debug!("bluetoothctl scan off: {e}");
        }

        let output = match self.ctl.devices(DEVICES_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Error listing devices: {e}");
                String::new()
            }
        };
        parse_bluetoothctl_devices(&output, &self.product)
    }

    fn report(&self, muses: &[DeviceDescriptor]) {
        if muses.is_empty() {
            self.status.line("No Muses found.");
        }
        for m in muses {
            self.status.line(format_args!("Found device {}, MAC Address {}", m.name, m.address));
        }
    }
}

async fn scan_with(backend: &mut dyn BleBackend, scan_timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
    backend.start().await?;
    let devices = backend.scan(scan_timeout).await?;
    backend.stop().await?;
    Ok(devices)
}
