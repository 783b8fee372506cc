//! BLE backends and the selector that picks one per invocation.
//!
//! A backend is a capability ([`BleBackend`]) rather than a string: the
//! selector turns the requested [`BackendKind`] into a [`Strategy`] once, and
//! everything downstream calls methods on whatever it got back.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::assemble::Clock;
use crate::error::{Error, Result};
use crate::types::{DeviceDescriptor, Modality, SampleBatch};

pub mod bluemuse;
pub mod btle;

pub use bluemuse::{BlueMuse, ShellLauncher, UriLauncher};
pub use btle::BtleBackend;

/// Callback a session invokes with each completed batch of one modality.
pub type SampleCallback = Box<dyn Fn(SampleBatch) + Send + Sync>;

/// Interface name the `gatt` backend binds to when none is given.
pub const DEFAULT_GATT_INTERFACE: &str = "hci0";

// ── Backend kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `bluetoothctl` when present, else the platform default adapter.
    #[default]
    Auto,
    /// BlueZ adapter bound to a named interface.
    Gatt,
    /// The host's native BLE stack.
    #[serde(alias = "bleak")]
    Native,
    /// BLED112 dongle on a serial port.
    Bgapi,
    /// External BlueMuse bridge application (Windows).
    BlueMuse,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Gatt => "gatt",
            BackendKind::Native => "native",
            BackendKind::Bgapi => "bgapi",
            BackendKind::BlueMuse => "bluemuse",
        }
    }

    /// What `auto` means on this host when `bluetoothctl` is not in play.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::Gatt
        } else {
            BackendKind::Native
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "gatt" => Ok(BackendKind::Gatt),
            "native" | "bleak" => Ok(BackendKind::Native),
            "bgapi" => Ok(BackendKind::Bgapi),
            "bluemuse" => Ok(BackendKind::BlueMuse),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

/// Auxiliary backend parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Interface name for `gatt`, serial port for `bgapi`.
    pub interface: Option<String>,
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// The device a session should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub address: String,
    pub name: Option<String>,
}

impl From<&DeviceDescriptor> for SessionTarget {
    fn from(device: &DeviceDescriptor) -> Self {
        Self {
            address: device.address.clone(),
            name: Some(device.name.clone()),
        }
    }
}

/// Headset settings applied when a session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Preset command (`p21`, `p50`, …); chosen from the enabled modalities
    /// when `None`.
    pub preset: Option<String>,
    /// Turn the front LED off (`L0`).
    pub disable_light: bool,
    /// Time base for sample timestamps.
    pub clock: Clock,
}

/// A BLE adapter able to scan and to open headset sessions.
#[async_trait]
pub trait BleBackend: Send {
    fn kind(&self) -> BackendKind;

    async fn start(&mut self) -> Result<()>;

    /// Scan for `timeout` and return every named peripheral seen.
    async fn scan(&mut self, timeout: Duration) -> Result<Vec<DeviceDescriptor>>;

    async fn stop(&mut self) -> Result<()>;

    fn open_session(&self, target: SessionTarget, options: SessionOptions) -> Box<dyn MuseSession>;
}

/// One connection to one headset.
///
/// Callbacks are registered before [`MuseSession::connect`] and are never
/// invoked once [`MuseSession::disconnect`] has returned.
#[async_trait]
pub trait MuseSession: Send {
    fn register_callback(&mut self, modality: Modality, callback: SampleCallback);

    /// Connect, making at most `retries` attempts (at least one).
    async fn connect(&mut self, retries: u32) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Detects host tooling.
pub trait ToolProbe: Send + Sync {
    fn has_bluetoothctl(&self) -> bool;
}

/// Looks `bluetoothctl` up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ToolProbe for SystemProbe {
    fn has_bluetoothctl(&self) -> bool {
        which::which("bluetoothctl").is_ok()
    }
}

/// Builds in-process adapters for concrete backend kinds.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn BleBackend>>;
}

/// btleplug-backed adapters for `gatt` and `native`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformAdapters;

impl AdapterFactory for PlatformAdapters {
    fn create(&self, kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn BleBackend>> {
        match kind {
            BackendKind::Gatt => {
                let interface = options
                    .interface
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GATT_INTERFACE.to_string());
                Ok(Box::new(BtleBackend::new(BackendKind::Gatt, Some(interface))))
            }
            BackendKind::Native => Ok(Box::new(BtleBackend::new(BackendKind::Native, None))),
            BackendKind::Bgapi => {
                let port = options.interface.as_deref().ok_or(Error::MissingParameter {
                    backend: "bgapi",
                    parameter: "a serial port",
                })?;
                debug!("bgapi: serial port {port}");
                Err(Error::UnsupportedBackend("bgapi".into()))
            }
            BackendKind::Auto | BackendKind::BlueMuse => {
                Err(Error::UnsupportedBackend(kind.to_string()))
            }
        }
    }
}

// ── Selector ──────────────────────────────────────────────────────────────────

/// How discovery runs for one invocation.
pub enum Strategy {
    /// Enumerate through the OS `bluetoothctl` tool.
    BluetoothCtl,
    /// Scan with an in-process adapter.
    Adapter(Box<dyn BleBackend>),
    /// Hand everything to the BlueMuse bridge.
    BlueMuse(BlueMuse),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::BluetoothCtl => f.write_str("BluetoothCtl"),
            Strategy::Adapter(backend) => write!(f, "Adapter({})", backend.kind()),
            Strategy::BlueMuse(_) => f.write_str("BlueMuse"),
        }
    }
}

pub struct BackendSelector {
    options: BackendOptions,
    probe: Box<dyn ToolProbe>,
    adapters: Box<dyn AdapterFactory>,
    launcher: Arc<dyn UriLauncher>,
}

impl BackendSelector {
    /// Selector wired to the host: `which`, btleplug and the shell.
    pub fn new(options: BackendOptions) -> Self {
        Self::with_parts(
            options,
            Box::new(SystemProbe),
            Box::new(PlatformAdapters),
            Arc::new(ShellLauncher),
        )
    }

    pub fn with_parts(
        options: BackendOptions,
        probe: Box<dyn ToolProbe>,
        adapters: Box<dyn AdapterFactory>,
        launcher: Arc<dyn UriLauncher>,
    ) -> Self {
        Self {
            options,
            probe,
            adapters,
            launcher,
        }
    }

    /// Handle on the BlueMuse bridge.
    pub fn bridge(&self) -> BlueMuse {
        BlueMuse::new(Arc::clone(&self.launcher))
    }

    /// Discovery strategy for `requested`.
    pub fn resolve(&self, requested: BackendKind) -> Result<Strategy> {
        match requested {
            BackendKind::Auto if self.probe.has_bluetoothctl() => {
                info!("Backend auto: using bluetoothctl for discovery");
                Ok(Strategy::BluetoothCtl)
            }
            BackendKind::BlueMuse => Ok(Strategy::BlueMuse(self.bridge())),
            kind => {
                let kind = concrete(kind);
                debug!("Backend {requested}: using {kind} adapter");
                Ok(Strategy::Adapter(self.adapters.create(kind, &self.options)?))
            }
        }
    }

    /// Adapter the session itself connects through. Never the OS tool.
    pub fn connector(&self, requested: BackendKind) -> Result<Box<dyn BleBackend>> {
        self.adapters.create(concrete(requested), &self.options)
    }
}

fn concrete(kind: BackendKind) -> BackendKind {
    match kind {
        BackendKind::Auto => BackendKind::platform_default(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct FixedProbe(bool);

    impl ToolProbe for FixedProbe {
        fn has_bluetoothctl(&self) -> bool {
            self.0
        }
    }

    struct NullBackend(BackendKind);

    #[async_trait]
    impl BleBackend for NullBackend {
        fn kind(&self) -> BackendKind {
            self.0
        }
        async fn start(&mut self) -> Result<()> {
            Ok(())
        }
        async fn scan(&mut self, _timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
            Ok(Vec::new())
        }
        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn open_session(&self, _target: SessionTarget, _options: SessionOptions) -> Box<dyn MuseSession> {
            unimplemented!("not used by selector tests")
        }
    }

    /// Counts constructions and delegates parameter checks to the real factory.
    #[derive(Default)]
    struct CountingFactory {
        calls: Arc<AtomicUsize>,
        kinds: Arc<Mutex<Vec<BackendKind>>>,
    }

    impl AdapterFactory for CountingFactory {
        fn create(&self, kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn BleBackend>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.kinds.lock().unwrap().push(kind);
            if kind == BackendKind::Bgapi {
                return PlatformAdapters.create(kind, options);
            }
            Ok(Box::new(NullBackend(kind)))
        }
    }

    struct NoLaunch;

    impl UriLauncher for NoLaunch {
        fn launch(&self, _uri: &str) -> Result<()> {
            Ok(())
        }
    }

    fn build(bluetoothctl: bool, interface: Option<&str>) -> (BackendSelector, Arc<AtomicUsize>, Arc<Mutex<Vec<BackendKind>>>) {
        let factory = CountingFactory::default();
        let calls = Arc::clone(&factory.calls);
        let kinds = Arc::clone(&factory.kinds);
        let selector = BackendSelector::with_parts(
            BackendOptions {
                interface: interface.map(str::to_string),
            },
            Box::new(FixedProbe(bluetoothctl)),
            Box::new(factory),
            Arc::new(NoLaunch),
        );
        (selector, calls, kinds)
    }

    #[test]
    fn parses_tokens_and_alias() {
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!("bleak".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" BlueMuse ".parse::<BackendKind>().unwrap(), BackendKind::BlueMuse);
        assert!(matches!(
            "serial".parse::<BackendKind>(),
            Err(Error::UnknownBackend(t)) if t == "serial"
        ));
        let kind: BackendKind = serde_json::from_str("\"bleak\"").unwrap();
        assert_eq!(kind, BackendKind::Native);
    }

    #[test]
    fn auto_with_bluetoothctl_never_builds_an_adapter() {
        let (selector, calls, _) = build(true, None);
        let strategy = selector.resolve(BackendKind::Auto).unwrap();
        assert!(matches!(strategy, Strategy::BluetoothCtl));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auto_without_bluetoothctl_follows_platform_policy() {
        let (selector, calls, kinds) = build(false, None);
        let strategy = selector.resolve(BackendKind::Auto).unwrap();
        match strategy {
            Strategy::Adapter(backend) => assert_eq!(backend.kind(), BackendKind::platform_default()),
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kinds.lock().unwrap()[0], BackendKind::platform_default());
    }

    #[test]
    fn explicit_backends_pass_through() {
        let (selector, _, kinds) = build(true, Some("hci1"));
        assert!(matches!(selector.resolve(BackendKind::Gatt).unwrap(), Strategy::Adapter(_)));
        assert!(matches!(selector.resolve(BackendKind::Native).unwrap(), Strategy::Adapter(_)));
        assert!(matches!(selector.resolve(BackendKind::BlueMuse).unwrap(), Strategy::BlueMuse(_)));
        assert_eq!(*kinds.lock().unwrap(), vec![BackendKind::Gatt, BackendKind::Native]);
    }

    #[test]
    fn bgapi_requires_a_serial_port() {
        let (selector, _, _) = build(false, None);
        assert!(matches!(
            selector.resolve(BackendKind::Bgapi),
            Err(Error::MissingParameter { backend: "bgapi", .. })
        ));
        let (selector, _, _) = build(false, Some("/dev/ttyACM0"));
        assert!(matches!(
            selector.resolve(BackendKind::Bgapi),
            Err(Error::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn connector_ignores_bluetoothctl() {
        let (selector, calls, kinds) = build(true, None);
        let backend = selector.connector(BackendKind::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::platform_default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kinds.lock().unwrap().len(), 1);
    }

    #[test]
    fn gatt_defaults_to_hci0() {
        let backend = PlatformAdapters
            .create(BackendKind::Gatt, &BackendOptions::default())
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Gatt);
    }
}
