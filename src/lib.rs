//! # muse-lsl
//!
//! Async Rust library and command-line streamer that finds an
//! [Interaxon Muse](https://choosemuse.com/) headset over Bluetooth Low
//! Energy and publishes its EEG, PPG, accelerometer and gyroscope data onto a
//! sample bus, one output channel per modality.
//!
//! ## Supported hardware
//!
//! | Model | EEG ch | PPG | IMU |
//! |---|---|---|---|
//! | Muse 1 (2014) | 4 + AUX | ✗ | ✓ |
//! | Muse 2 | 4 + AUX | ✓ | ✓ |
//! | Muse S (Classic firmware) | 4 + AUX | ✓ | ✓ |
//!
//! ## Quick start
//!
//! ```no_run
//! use muse_lsl::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StreamConfig::default();
//!     let mut controller = SessionController::new(
//!         BackendSelector::new(config.backend_options()),
//!         DeviceLocator::default(),
//!         Box::new(JsonLinesBus::stdout()),
//!     );
//!     let outcome = controller.stream(&config.request(), &CancelToken::new()).await?;
//!     eprintln!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`backend`] | Backend kinds, the BLE capability traits, and the backend selector |
//! | [`locator`] | Device discovery through an adapter scan or `bluetoothctl` |
//! | [`session`] | The stream request state machine and its teardown |
//! | [`router`] | Fans decoded batches out to per-modality outlets |
//! | [`supervisor`] | Liveness, cancellation, and the streaming watchdog loop |
//! | [`outlet`] | Stream descriptions, the bus seam, and the JSON-lines bus |
//! | [`assemble`] | Notifications to timestamped sample batches |
//! | [`parse`] | Low-level byte-to-sample decoders for EEG, PPG and IMU packets |
//! | [`protocol`] | GATT UUIDs, sampling constants, and control-command framing |
//! | [`config`] | JSON stream configuration |
//! | [`status`] | Operator progress lines, kept apart from the bus |
//! | [`types`] | Descriptors, modalities, and sample batches |

pub mod assemble;
pub mod backend;
pub mod config;
pub mod error;
pub mod locator;
pub mod outlet;
pub mod parse;
pub mod protocol;
pub mod router;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod types;

pub use error::{Error, Result};

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Streaming ─────────────────────────────────────────────────────────────
    pub use crate::config::StreamConfig;
    pub use crate::status::Status;
    pub use crate::session::{SessionController, SessionState, StreamOutcome, StreamRequest};
    pub use crate::supervisor::{CancelToken, StopReason, SupervisorPolicy};

    // ── Discovery and backends ────────────────────────────────────────────────
    pub use crate::backend::{
        BackendKind, BackendOptions, BackendSelector, BleBackend, MuseSession, SampleCallback,
        SessionOptions, SessionTarget, Strategy,
    };
    pub use crate::locator::DeviceLocator;

    // ── Bus ───────────────────────────────────────────────────────────────────
    pub use crate::outlet::{DataBus, JsonLinesBus, Outlet, StreamInfo};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::{Error, Result};
    pub use crate::types::{DeviceDescriptor, Modality, ModalitySet, SampleBatch};
}
