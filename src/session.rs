//! The stream request lifecycle: resolve a headset, open channels, connect,
//! supervise, tear down.
//!
//! ```text
//! Idle ─▶ Resolving ─▶ Connecting ─▶ Streaming ─▶ Disconnecting ─▶ Closed
//!             │             │                                        ▲
//!             └─────────────┴──────── failure / cancel ──────────────┘
//! ```
//!
//! Once a session has connected, teardown (stop, disconnect, close channels)
//! runs exactly once whatever ends the stream, including the caller dropping
//! the [`SessionController::stream`] future.

use std::fmt;
use std::time::Duration;

use log::{info, warn};

use crate::backend::{
    BackendKind, BackendSelector, BleBackend, MuseSession, SessionOptions, SessionTarget, Strategy,
};
use crate::error::{Error, Result};
use crate::locator::DeviceLocator;
use crate::outlet::{ChannelSet, DataBus};
use crate::router::SampleRouter;
use crate::status::Status;
use crate::supervisor::{supervise, CancelToken, Liveness, StopReason, SupervisorPolicy};
use crate::types::ModalitySet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Connecting,
    Streaming,
    Disconnecting,
    Closed,
}

/// Everything one stream invocation needs.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Skip discovery and connect here.
    pub address: Option<String>,
    /// Exact name to discover when no address is given.
    pub name: Option<String>,
    pub backend: BackendKind,
    pub modalities: ModalitySet,
    pub options: SessionOptions,
    /// Total connection attempts.
    pub retries: u32,
    pub scan_timeout: Duration,
    pub policy: SupervisorPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Streamed in-process until `reason`.
    Streamed { reason: StopReason },
    /// Cancelled during discovery or connection; the headset was never
    /// told to start.
    Cancelled,
    /// Handed to the BlueMuse bridge.
    Delegated,
}

struct Streaming(ModalitySet);

impl fmt::Display for Streaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Streaming")?;
        for modality in self.0.iter() {
            write!(f, " {modality}")?;
        }
        f.write_str("...")
    }
}

pub struct SessionController {
    selector: BackendSelector,
    locator: DeviceLocator,
    bus: Box<dyn DataBus>,
    status: Status,
    state: SessionState,
}

impl SessionController {
    pub fn new(selector: BackendSelector, locator: DeviceLocator, bus: Box<dyn DataBus>) -> Self {
        Self {
            selector,
            locator,
            bus,
            status: Status::default(),
            state: SessionState::Idle,
        }
    }

    /// Send progress lines (this controller's and its locator's) to `status`.
    pub fn with_status(mut self, status: Status) -> Self {
        self.locator = self.locator.with_status(status.clone());
        self.status = status;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run one stream request to completion.
    ///
    /// Returns once the stream has ended and everything it opened is closed.
    /// `cancel` is honoured at every stage; before the headset has been
    /// started it ends the request with [`StreamOutcome::Cancelled`].
    pub async fn stream(&mut self, request: &StreamRequest, cancel: &CancelToken) -> Result<StreamOutcome> {
        if request.modalities.is_empty() {
            self.status
                .line("Stream initiation failed: At least one data source must be enabled.");
            return Err(Error::NoModalitiesRequested);
        }
        if request.backend == BackendKind::BlueMuse {
            return self.delegate(request);
        }

        self.state = SessionState::Resolving;
        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            resolved = self.resolve(request) => Some(resolved),
        };
        let (target, discovered) = match resolved {
            Some(Ok(resolved)) => resolved,
            Some(Err(e)) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
            None => return Ok(self.cancelled()),
        };

        self.state = SessionState::Connecting;
        let liveness = Liveness::new();
        let mut live = match self.connect(request, target, discovered, &liveness, cancel).await {
            Ok(Some(connected)) => Live(Some(connected)),
            Ok(None) => return Ok(self.cancelled()),
            Err(e) => {
                self.status.line("Failed to connect.");
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        self.status.line("Connected.");
        self.state = SessionState::Streaming;
        let streamed = live.run(&self.status, &request.modalities, &liveness, cancel, &request.policy).await;

        self.state = SessionState::Disconnecting;
        live.finish().await;
        self.state = SessionState::Closed;
        self.status.line("Disconnected.");

        streamed.map(|reason| StreamOutcome::Streamed { reason })
    }

    fn cancelled(&mut self) -> StreamOutcome {
        info!("Stream request cancelled before streaming began");
        self.state = SessionState::Closed;
        StreamOutcome::Cancelled
    }

    /// The headset to connect to, plus the adapter that found it, if any.
    async fn resolve(&mut self, request: &StreamRequest) -> Result<(SessionTarget, Option<Box<dyn BleBackend>>)> {
        if let Some(address) = &request.address {
            let target = SessionTarget {
                address: address.clone(),
                name: request.name.clone(),
            };
            return Ok((target, None));
        }

        let mut strategy = self.selector.resolve(request.backend)?;
        let found = self
            .locator
            .find(request.name.as_deref(), &mut strategy, request.scan_timeout)
            .await?;
        let device = found.ok_or_else(|| Error::DeviceNotFound {
            name: request.name.clone(),
        })?;
        info!("Resolved {} at {}", device.name, device.address);

        let adapter = match strategy {
            Strategy::Adapter(backend) => Some(backend),
            _ => None,
        };
        Ok((SessionTarget::from(&device), adapter))
    }

    /// Open channels and connect. On failure or cancellation nothing is
    /// left open; `Ok(None)` means `cancel` fired first.
    async fn connect(
        &self,
        request: &StreamRequest,
        target: SessionTarget,
        discovered: Option<Box<dyn BleBackend>>,
        liveness: &Liveness,
        cancel: &CancelToken,
    ) -> Result<Option<Connected>> {
        let mut channels = ChannelSet::open(self.bus.as_ref(), &request.modalities, &target.address)?;

        let backend = match discovered {
            Some(backend) => backend,
            None => match self.selector.connector(request.backend) {
                Ok(backend) => backend,
                Err(e) => {
                    channels.close();
                    return Err(e);
                }
            },
        };

        let address = target.address.clone();
        let mut session = backend.open_session(target, request.options.clone());
        let modalities: Vec<_> = channels.modalities().collect();
        for modality in modalities {
            if let Some(outlet) = channels.get(modality) {
                let router = SampleRouter::new(modality, outlet, liveness.clone())
                    .with_clock(request.options.clock);
                session.register_callback(modality, router.into_callback());
            }
        }

        info!("Connecting to {address} with up to {} attempt(s)", request.retries.max(1));
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            attempt = session.connect(request.retries) => Some(attempt),
        };
        match attempt {
            Some(Ok(())) => Ok(Some(Connected { session, channels })),
            Some(Err(e)) => {
                channels.close();
                Err(e)
            }
            None => {
                // An interrupted attempt may have linked up already.
                if let Err(e) = session.disconnect().await {
                    warn!("Disconnect after cancel failed: {e}");
                }
                channels.close();
                Ok(None)
            }
        }
    }

    fn delegate(&mut self, request: &StreamRequest) -> Result<StreamOutcome> {
        let bridge = self.selector.bridge();
        bridge.configure(&request.modalities)?;
        bridge.open()?;

        let address = request.address.as_deref();
        let name = request.name.as_deref();
        if address.is_none() && name.is_none() {
            self.status.line("Targeting first device BlueMuse discovers...");
        } else {
            let device: Vec<&str> = [name, address].into_iter().flatten().collect();
            self.status.line(format_args!("Targeting device: {}...", device.join(":")));
        }
        self.status.line(
            "\n*BlueMuse will auto connect and stream when the device is found. \
             \n*You can also use the BlueMuse interface to manage your stream(s).",
        );
        bridge.target(address, name)?;

        self.state = SessionState::Closed;
        Ok(StreamOutcome::Delegated)
    }
}

/// A connected session and the channels its callbacks push to.
struct Connected {
    session: Box<dyn MuseSession>,
    channels: ChannelSet,
}

impl Connected {
    /// Stop, disconnect, close. A failing step never skips the next one.
    async fn teardown(mut self) {
        if let Err(e) = self.session.stop().await {
            warn!("Stopping the headset failed: {e}");
        }
        if let Err(e) = self.session.disconnect().await {
            warn!("Disconnect failed: {e}");
        }
        self.channels.close();
    }
}

/// Owns a [`Connected`] until [`Live::finish`]. Dropped early, it spawns
/// the same teardown on the current runtime.
struct Live(Option<Connected>);

impl Live {
    async fn run(
        &mut self,
        status: &Status,
        modalities: &ModalitySet,
        liveness: &Liveness,
        cancel: &CancelToken,
        policy: &SupervisorPolicy,
    ) -> Result<StopReason> {
        let Some(connected) = self.0.as_mut() else {
            return Ok(StopReason::Cancelled);
        };
        if cancel.is_cancelled() {
            return Ok(StopReason::Cancelled);
        }
        connected.session.start().await?;
        status.line(Streaming(*modalities));
        let reason = supervise(liveness, cancel, policy).await;
        info!("Stream ended: {reason}");
        Ok(reason)
    }

    async fn finish(mut self) {
        if let Some(connected) = self.0.take() {
            connected.teardown().await;
        }
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        let Some(connected) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Stream dropped while connected, tearing down in the background");
                handle.spawn(connected.teardown());
            }
            Err(_) => warn!("Stream dropped outside a runtime, closing channels only"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Modality;

    #[test]
    fn streaming_line_lists_enabled_modalities() {
        let set = ModalitySet::default().with(Modality::Ppg).with(Modality::Gyro);
        assert_eq!(Streaming(set).to_string(), "Streaming EEG PPG GYRO...");
    }
}
