//! In-process BLE through btleplug: the `gatt` and `native` backends.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::{BackendKind, BleBackend, MuseSession, SampleCallback, SessionOptions, SessionTarget};
use crate::assemble::BatchAssembler;
use crate::error::{Error, Result};
use crate::parse::ControlAccumulator;
use crate::protocol::{
    characteristics, decode_response, encode_command, CONTROL_CHARACTERISTIC, PRESET_DEFAULT,
    PRESET_WITH_PPG,
};
use crate::types::{DeviceDescriptor, Modality};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);
/// How long a session scans for its target when the adapter has not seen it.
const TARGET_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

fn scan_error(e: impl std::fmt::Display) -> Error {
    Error::ScanBackend(e.to_string())
}

// ── Adapter selection ─────────────────────────────────────────────────────────

/// First adapter whose info mentions `interface`, else the first adapter.
async fn select_adapter(interface: Option<&str>) -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    let mut chosen = None;
    if let Some(interface) = interface {
        for adapter in &adapters {
            if let Ok(info) = adapter.adapter_info().await {
                if info.contains(interface) {
                    chosen = Some(adapter.clone());
                    break;
                }
            }
        }
        if chosen.is_none() {
            warn!("No adapter matches '{interface}', using the first one");
        }
    }

    let adapter = match chosen {
        Some(adapter) => adapter,
        None => adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::ScanBackend("no Bluetooth adapter found".into()))?,
    };
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// CoreBluetooth starts in an unknown state and ignores scans until it
/// reports PoweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// MAC address when the platform exposes one, platform peripheral id otherwise.
fn peripheral_address(peripheral: &Peripheral, props: &PeripheralProperties) -> String {
    if props.address.into_inner() == [0u8; 6] {
        peripheral.id().to_string()
    } else {
        props.address.to_string()
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral> {
    async fn known(adapter: &Adapter, address: &str) -> Option<Peripheral> {
        for p in adapter.peripherals().await.unwrap_or_default() {
            if let Ok(Some(props)) = p.properties().await {
                if peripheral_address(&p, &props).eq_ignore_ascii_case(address) {
                    return Some(p);
                }
            }
        }
        None
    }

    if let Some(p) = known(adapter, address).await {
        return Ok(p);
    }

    debug!("{address} not cached, scanning for it");
    adapter.start_scan(ScanFilter::default()).await?;
    let found = timeout(TARGET_SCAN_TIMEOUT, async {
        loop {
            if let Some(p) = known(adapter, address).await {
                return p;
            }
            sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    adapter.stop_scan().await.ok();
    found.map_err(|_| Error::Ble(btleplug::Error::DeviceNotFound))
}

// ── Backend ───────────────────────────────────────────────────────────────────

pub struct BtleBackend {
    kind: BackendKind,
    interface: Option<String>,
    adapter: Option<Adapter>,
}

impl BtleBackend {
    /// Nothing touches the radio until [`BleBackend::start`].
    pub fn new(kind: BackendKind, interface: Option<String>) -> Self {
        Self {
            kind,
            interface,
            adapter: None,
        }
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| Error::ScanBackend("backend not started".into()))
    }
}

#[async_trait]
impl BleBackend for BtleBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start(&mut self) -> Result<()> {
        let adapter = select_adapter(self.interface.as_deref())
            .await
            .map_err(scan_error)?;
        self.adapter = Some(adapter);
        Ok(())
    }

    async fn scan(&mut self, duration: Duration) -> Result<Vec<DeviceDescriptor>> {
        let adapter = self.adapter()?;
        info!("{}: scanning for {duration:?}", self.kind);
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)?;
        sleep(duration).await;
        adapter.stop_scan().await.ok();

        let mut found = Vec::new();
        for p in adapter.peripherals().await.map_err(scan_error)? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name.clone() {
                    let address = peripheral_address(&p, &props);
                    debug!("scan: {name} at {address}");
                    found.push(DeviceDescriptor { name, address });
                }
            }
        }
        Ok(found)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(adapter) = &self.adapter {
            adapter.stop_scan().await.ok();
        }
        Ok(())
    }

    fn open_session(&self, target: SessionTarget, options: SessionOptions) -> Box<dyn MuseSession> {
        Box::new(BtleSession {
            interface: self.interface.clone(),
            adapter: self.adapter.clone(),
            target,
            options,
            callbacks: HashMap::new(),
            link: None,
        })
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Link {
    peripheral: Peripheral,
    control: Characteristic,
    connected: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
    preset: String,
}

/// Classic-firmware session: one characteristic per sensor channel.
pub struct BtleSession {
    interface: Option<String>,
    adapter: Option<Adapter>,
    target: SessionTarget,
    options: SessionOptions,
    callbacks: HashMap<Modality, SampleCallback>,
    link: Option<Link>,
}

impl BtleSession {
    fn preset(&self) -> String {
        self.options.preset.clone().unwrap_or_else(|| {
            let preset = if self.callbacks.contains_key(&Modality::Ppg) {
                PRESET_WITH_PPG
            } else {
                PRESET_DEFAULT
            };
            preset.to_string()
        })
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = select_adapter(self.interface.as_deref()).await?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// One connection attempt. On success the peripheral is connected and
    /// subscribed; on failure it is left disconnected.
    async fn attempt(&mut self) -> Result<(Peripheral, Characteristic)> {
        let adapter = self.adapter().await?;
        let peripheral = find_peripheral(&adapter, &self.target.address).await?;

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| Error::Ble(btleplug::Error::TimedOut(CONNECT_TIMEOUT)))??;

        match self.subscribe(&peripheral).await {
            Ok(control) => Ok((peripheral, control)),
            Err(e) => {
                peripheral.disconnect().await.ok();
                Err(e)
            }
        }
    }

    async fn subscribe(&self, peripheral: &Peripheral) -> Result<Characteristic> {
        // BlueZ reports the link before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        sleep(Duration::from_millis(600)).await;

        timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| Error::Ble(btleplug::Error::TimedOut(DISCOVER_TIMEOUT)))??;

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find = |uuid: Uuid| chars.iter().find(|c| c.uuid == uuid).cloned();

        let control = find(CONTROL_CHARACTERISTIC).ok_or_else(|| {
            Error::Ble(btleplug::Error::NoSuchCharacteristic)
        })?;
        peripheral.subscribe(&control).await?;

        for modality in self.callbacks.keys() {
            for &uuid in characteristics(*modality) {
                match find(uuid) {
                    Some(c) => peripheral.subscribe(&c).await?,
                    None => warn!("{modality} characteristic {uuid} not found"),
                }
            }
        }
        Ok(control)
    }

    async fn send(&self, cmd: &str) -> Result<()> {
        let link = self.link.as_ref().ok_or(Error::Ble(btleplug::Error::NotConnected))?;
        debug!("control <- {cmd}");
        link.peripheral
            .write(&link.control, &encode_command(cmd), WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

/// Control replies arrive as JSON split across notifications.
fn log_control_reply(json: &str) {
    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(serde_json::Value::Object(fields)) => {
            if let Some(fw) = fields.get("fw") {
                info!("Headset firmware {fw}");
            }
            debug!("control -> {json}");
        }
        Ok(_) => debug!("control -> {json}"),
        Err(e) => warn!("Control JSON parse error: {e} | raw: {json}"),
    }
}

#[async_trait]
impl MuseSession for BtleSession {
    fn register_callback(&mut self, modality: Modality, callback: SampleCallback) {
        self.callbacks.insert(modality, callback);
    }

    async fn connect(&mut self, retries: u32) -> Result<()> {
        let attempts = retries.max(1);
        let address = self.target.address.clone();

        for attempt in 1..=attempts {
            info!("Connecting to {address} (attempt {attempt}/{attempts})");
            let (peripheral, control) = match self.attempt().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Connection attempt {attempt} failed: {e}");
                    continue;
                }
            };
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Connection attempt {attempt} failed: {e}");
                    peripheral.disconnect().await.ok();
                    continue;
                }
            };

            let preset = self.preset();
            let clock = self.options.clock;
            let connected = Arc::new(AtomicBool::new(true));
            let callbacks = Arc::new(std::mem::take(&mut self.callbacks));
            let flag = Arc::clone(&connected);

            let dispatcher = tokio::spawn(async move {
                let mut assembler = BatchAssembler::new();
                let mut control = ControlAccumulator::default();
                while let Some(n) = notifications.next().await {
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                    if n.uuid == CONTROL_CHARACTERISTIC {
                        if let Some(json) = control.push(&decode_response(&n.value)) {
                            log_control_reply(&json);
                        }
                        continue;
                    }
                    if let Some((modality, batch)) = assembler.push(n.uuid, &n.value, clock.now()) {
                        if let Some(callback) = callbacks.get(&modality) {
                            callback(batch);
                        }
                    }
                }
                flag.store(false, Ordering::Release);
                info!("Notification stream ended");
            });

            self.link = Some(Link {
                peripheral,
                control,
                connected,
                dispatcher,
                preset,
            });
            return Ok(());
        }

        Err(Error::ConnectFailure { address, attempts })
    }

    /// `h` (halt), `s` (status), preset, optional `L0`, then `d` (data).
    async fn start(&mut self) -> Result<()> {
        let preset = match &self.link {
            Some(link) => link.preset.clone(),
            None => return Err(Error::Ble(btleplug::Error::NotConnected)),
        };
        self.send("h").await?;
        self.send("s").await?;
        self.send(&preset).await?;
        if self.options.disable_light {
            self.send("L0").await?;
        }
        self.send("d").await
    }

    async fn stop(&mut self) -> Result<()> {
        self.send("h").await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.connected.store(false, Ordering::Release);
        link.dispatcher.abort();
        // Wait for the task so no callback outlives this call.
        let _ = link.dispatcher.await;
        self.callbacks.clear();
        link.peripheral.disconnect().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.connected.load(Ordering::Acquire))
    }
}

impl Drop for BtleSession {
    /// Dropped while linked: silence callbacks now, release the link in the
    /// background.
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        link.connected.store(false, Ordering::Release);
        link.dispatcher.abort();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let peripheral = link.peripheral;
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Disconnect on drop failed: {e}");
                    }
                });
            }
            Err(_) => warn!("Session dropped outside a runtime, link left to the OS"),
        }
    }
}
