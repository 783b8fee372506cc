//! End-to-end stream requests against recording mocks: no radio, no real bus.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use muse_lsl::backend::{
    AdapterFactory, BackendKind, BackendOptions, BackendSelector, BleBackend, MuseSession,
    SampleCallback, SessionOptions, SessionTarget, ToolProbe, UriLauncher,
};
use muse_lsl::locator::{BluetoothCtl, DeviceLocator};
use muse_lsl::outlet::{DataBus, JsonLinesBus, Outlet, StreamInfo};
use muse_lsl::session::{SessionController, SessionState, StreamOutcome, StreamRequest};
use muse_lsl::status::Status;
use muse_lsl::supervisor::{CancelToken, StopReason, SupervisorPolicy};
use muse_lsl::types::{DeviceDescriptor, Modality, ModalitySet, SampleBatch};
use muse_lsl::{Error, Result};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

// ── Bus ───────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingBus {
    log: Log,
    pushes: Arc<AtomicUsize>,
}

struct RecordingOutlet {
    stream_type: String,
    channels: usize,
    log: Log,
    pushes: Arc<AtomicUsize>,
}

impl DataBus for RecordingBus {
    fn open_stream(&self, info: &StreamInfo) -> Result<Box<dyn Outlet>> {
        record(&self.log, format!("open {}", info.stream_type));
        Ok(Box::new(RecordingOutlet {
            stream_type: info.stream_type.clone(),
            channels: info.channel_count,
            log: Arc::clone(&self.log),
            pushes: Arc::clone(&self.pushes),
        }))
    }
}

impl Outlet for RecordingOutlet {
    fn push_sample(&mut self, sample: &[f32], _timestamp: Option<f64>) -> Result<()> {
        assert_eq!(sample.len(), self.channels);
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        record(&self.log, format!("close {}", self.stream_type));
        Ok(())
    }
}

// ── Backend and session ───────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    /// Connect fails on every attempt.
    Refuse,
    /// One EEG batch on start, then nothing.
    EmitOnce,
    /// Connected but never emits.
    Silent,
    /// Keeps emitting until disconnected.
    Stream,
}

struct MockSession {
    behaviour: Behaviour,
    log: Log,
    callbacks: Arc<Mutex<Vec<(Modality, SampleCallback)>>>,
    feeder: Option<tokio::task::JoinHandle<()>>,
    connected: bool,
}

fn eeg_batch() -> SampleBatch {
    SampleBatch::Matrix {
        rows: vec![vec![0.0; 12]; 5],
        timestamps: (0..12).map(|i| i as f64 / 256.0).collect(),
    }
}

fn emit(callbacks: &Mutex<Vec<(Modality, SampleCallback)>>) {
    for (modality, callback) in callbacks.lock().unwrap().iter() {
        if *modality == Modality::Eeg {
            callback(eeg_batch());
        }
    }
}

#[async_trait]
impl MuseSession for MockSession {
    fn register_callback(&mut self, modality: Modality, callback: SampleCallback) {
        record(&self.log, format!("register {modality}"));
        self.callbacks.lock().unwrap().push((modality, callback));
    }

    async fn connect(&mut self, retries: u32) -> Result<()> {
        record(&self.log, format!("connect {retries}"));
        if self.behaviour == Behaviour::Refuse {
            return Err(Error::ConnectFailure {
                address: "00:55:DA:B0:12:34".into(),
                attempts: retries.max(1),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        record(&self.log, "start");
        match self.behaviour {
            Behaviour::EmitOnce => emit(&self.callbacks),
            Behaviour::Stream => {
                let callbacks = Arc::clone(&self.callbacks);
                self.feeder = Some(tokio::spawn(async move {
                    loop {
                        emit(&callbacks);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }));
            }
            Behaviour::Silent | Behaviour::Refuse => {}
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        record(&self.log, "stop");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        record(&self.log, "disconnect");
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
            let _ = feeder.await;
        }
        self.callbacks.lock().unwrap().clear();
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct MockBackend {
    behaviour: Behaviour,
    log: Log,
    devices: Vec<DeviceDescriptor>,
}

#[async_trait]
impl BleBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn scan(&mut self, _timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        record(&self.log, "scan");
        Ok(self.devices.clone())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn open_session(&self, target: SessionTarget, _options: SessionOptions) -> Box<dyn MuseSession> {
        record(&self.log, format!("session {}", target.address));
        Box::new(MockSession {
            behaviour: self.behaviour,
            log: Arc::clone(&self.log),
            callbacks: Arc::default(),
            feeder: None,
            connected: false,
        })
    }
}

struct MockFactory {
    behaviour: Behaviour,
    log: Log,
    constructed: Arc<AtomicUsize>,
}

impl AdapterFactory for MockFactory {
    fn create(&self, _kind: BackendKind, _options: &BackendOptions) -> Result<Box<dyn BleBackend>> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBackend {
            behaviour: self.behaviour,
            log: Arc::clone(&self.log),
            devices: vec![
                DeviceDescriptor {
                    name: "Muse-1234".into(),
                    address: "00:55:DA:B0:12:34".into(),
                },
                DeviceDescriptor {
                    name: "Keyboard".into(),
                    address: "11:22:33:44:55:66".into(),
                },
            ],
        }))
    }
}

// ── Host tooling ──────────────────────────────────────────────────────────────

struct Probe(bool);

impl ToolProbe for Probe {
    fn has_bluetoothctl(&self) -> bool {
        self.0
    }
}

struct NoLaunch;

impl UriLauncher for NoLaunch {
    fn launch(&self, _uri: &str) -> Result<()> {
        Ok(())
    }
}

struct FakeCtl;

#[async_trait]
impl BluetoothCtl for FakeCtl {
    async fn scan_on(&mut self) -> Result<()> {
        Ok(())
    }
    async fn scan_off(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
    async fn devices(&mut self, _timeout: Duration) -> Result<String> {
        Ok("Device 00:55:DA:B0:99:99 Muse-9999\n".into())
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    controller: SessionController,
    log: Log,
    pushes: Arc<AtomicUsize>,
    constructed: Arc<AtomicUsize>,
}

fn controller(
    behaviour: Behaviour,
    bluetoothctl: bool,
    log: &Log,
    constructed: &Arc<AtomicUsize>,
    bus: Box<dyn DataBus>,
) -> SessionController {
    let selector = BackendSelector::with_parts(
        BackendOptions::default(),
        Box::new(Probe(bluetoothctl)),
        Box::new(MockFactory {
            behaviour,
            log: Arc::clone(log),
            constructed: Arc::clone(constructed),
        }),
        Arc::new(NoLaunch),
    );
    SessionController::new(selector, DeviceLocator::new(Box::new(FakeCtl)), bus)
}

fn harness(behaviour: Behaviour, bluetoothctl: bool) -> Harness {
    let log = Log::default();
    let constructed = Arc::new(AtomicUsize::new(0));
    let bus = RecordingBus {
        log: Arc::clone(&log),
        pushes: Arc::default(),
    };
    let pushes = Arc::clone(&bus.pushes);
    Harness {
        controller: controller(behaviour, bluetoothctl, &log, &constructed, Box::new(bus)),
        log,
        pushes,
        constructed,
    }
}

/// A `Write` sink tests can read back.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn request(address: Option<&str>) -> StreamRequest {
    StreamRequest {
        address: address.map(str::to_string),
        name: None,
        backend: BackendKind::Auto,
        modalities: ModalitySet::default().with(Modality::Acc),
        options: SessionOptions::default(),
        retries: 1,
        scan_timeout: Duration::from_secs(1),
        policy: SupervisorPolicy::default(),
    }
}

fn events(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Tail of the log for any stream that connected.
const TEARDOWN: [&str; 4] = ["stop", "disconnect", "close EEG", "close ACC"];

fn assert_single_teardown(log: &Log) {
    let events = events(log);
    let tail: Vec<&str> = events[events.len() - 4..].iter().map(String::as_str).collect();
    assert_eq!(tail, TEARDOWN);
    for step in TEARDOWN {
        assert_eq!(events.iter().filter(|e| *e == step).count(), 1, "{step} in {events:?}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn nothing_requested_touches_nothing() {
    let mut h = harness(Behaviour::EmitOnce, false);
    let mut req = request(Some("00:55:DA:B0:12:34"));
    req.modalities = ModalitySet::none();

    let err = h.controller.stream(&req, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::NoModalitiesRequested));
    assert!(events(&h.log).is_empty());
    assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn failed_connect_closes_channels_and_pushes_nothing() {
    let mut h = harness(Behaviour::Refuse, false);
    let err = h
        .controller
        .stream(&request(Some("00:55:DA:B0:12:34")), &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConnectFailure { attempts: 1, .. }));
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.pushes.load(Ordering::SeqCst), 0);
    let events = events(&h.log);
    assert_eq!(events.last().map(String::as_str), Some("close ACC"));
    assert!(events.contains(&"close EEG".to_string()));
    assert!(!events.contains(&"stop".to_string()));
    assert!(!events.contains(&"disconnect".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stale_link_tears_down_once() {
    let mut h = harness(Behaviour::EmitOnce, false);
    let outcome = h
        .controller
        .stream(&request(Some("00:55:DA:B0:12:34")), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Streamed { reason: StopReason::StaleLink });
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.pushes.load(Ordering::SeqCst), 12);
    assert_single_teardown(&h.log);
}

#[tokio::test(start_paused = true)]
async fn silent_session_tears_down_once() {
    let mut h = harness(Behaviour::Silent, false);
    let outcome = h
        .controller
        .stream(&request(Some("00:55:DA:B0:12:34")), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Streamed { reason: StopReason::SilentConnect });
    assert_eq!(h.pushes.load(Ordering::SeqCst), 0);
    assert_single_teardown(&h.log);
}

#[tokio::test(start_paused = true)]
async fn cancellation_tears_down_once() {
    let mut h = harness(Behaviour::Stream, false);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let outcome = h
        .controller
        .stream(&request(Some("00:55:DA:B0:12:34")), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Streamed { reason: StopReason::Cancelled });
    assert!(h.pushes.load(Ordering::SeqCst) > 0);
    assert_single_teardown(&h.log);

    // Nothing is pushed once the session has disconnected.
    let settled = h.pushes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.pushes.load(Ordering::SeqCst), settled);
}

#[tokio::test(start_paused = true)]
async fn bluetoothctl_discovery_builds_only_the_session_adapter() {
    let mut h = harness(Behaviour::EmitOnce, true);
    h.controller
        .stream(&request(None), &CancelToken::new())
        .await
        .unwrap();

    // One construction: the connector. Discovery went through bluetoothctl.
    assert_eq!(h.constructed.load(Ordering::SeqCst), 1);
    let events = events(&h.log);
    assert!(events.contains(&"session 00:55:DA:B0:99:99".to_string()));
    assert!(!events.contains(&"scan".to_string()));
}

#[tokio::test(start_paused = true)]
async fn adapter_discovery_reuses_the_scanning_adapter() {
    let mut h = harness(Behaviour::EmitOnce, false);
    h.controller
        .stream(&request(None), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(h.constructed.load(Ordering::SeqCst), 1);
    let events = events(&h.log);
    assert_eq!(events[0], "scan");
    assert!(events.contains(&"session 00:55:DA:B0:12:34".to_string()));
}

#[tokio::test]
async fn unknown_name_is_not_found() {
    let mut h = harness(Behaviour::EmitOnce, false);
    let mut req = request(None);
    req.name = Some("Muse-0000".into());

    let err = h.controller.stream(&req, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { name: Some(_) }));
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert!(!events(&h.log).iter().any(|e| e.starts_with("open")));
}

#[tokio::test]
async fn bluemuse_requests_are_delegated() {
    let mut h = harness(Behaviour::EmitOnce, false);
    let mut req = request(None);
    req.backend = BackendKind::BlueMuse;

    let outcome = h.controller.stream(&req, &CancelToken::new()).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Delegated);
    assert!(events(&h.log).is_empty());
    assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn bus_output_stays_pure_json_lines() {
    let log = Log::default();
    let constructed = Arc::new(AtomicUsize::new(0));
    let bus_out = Capture::default();
    let status_out = Capture::default();
    let mut controller = controller(
        Behaviour::EmitOnce,
        false,
        &log,
        &constructed,
        Box::new(JsonLinesBus::new(bus_out.clone())),
    )
    .with_status(Status::new(status_out.clone()));

    controller
        .stream(&request(None), &CancelToken::new())
        .await
        .unwrap();

    let records: Vec<serde_json::Value> = bus_out
        .text()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("{e}: {line:?}")))
        .collect();
    assert_eq!(records.first().map(|r| r["event"].clone()), Some("open".into()));
    assert_eq!(records.iter().filter(|r| r["event"] == "sample").count(), 12);
    assert_eq!(records.iter().filter(|r| r["event"] == "close").count(), 2);

    let status = status_out.text();
    for line in [
        "Found device Muse-1234, MAC Address 00:55:DA:B0:12:34",
        "Connected.",
        "Streaming EEG ACC...",
        "Disconnected.",
    ] {
        assert!(status.lines().any(|l| l == line), "{line:?} missing from {status:?}");
    }
}

#[tokio::test]
async fn cancelled_before_resolving_touches_nothing() {
    let mut h = harness(Behaviour::Stream, false);
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = h.controller.stream(&request(None), &cancel).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert!(events(&h.log).is_empty());
    assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_discovery_never_connects_or_starts() {
    // The bluetoothctl listing waits out the full scan timeout.
    let mut h = harness(Behaviour::Stream, true);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let outcome = h.controller.stream(&request(None), &cancel).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert!(events(&h.log).is_empty());
    assert_eq!(h.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_future_still_tears_down() {
    let mut h = harness(Behaviour::Stream, false);
    let req = request(Some("00:55:DA:B0:12:34"));
    let cancel = CancelToken::new();

    let elapsed = tokio::time::timeout(Duration::from_secs(5), h.controller.stream(&req, &cancel)).await;
    assert!(elapsed.is_err());
    assert!(h.pushes.load(Ordering::SeqCst) > 0);

    // Teardown runs on a spawned task once the future is gone.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_single_teardown(&h.log);

    let settled = h.pushes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.pushes.load(Ordering::SeqCst), settled);
}
