use thiserror::Error;

/// Errors surfaced by discovery, backend selection and the streaming session.
///
/// Only [`Error::NoModalitiesRequested`], [`Error::DeviceNotFound`] and
/// [`Error::ConnectFailure`] stop a stream request before streaming starts.
/// Link loss and operator cancellation end a session through
/// [`crate::supervisor::StopReason`] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("at least one data source must be enabled")]
    NoModalitiesRequested,

    #[error("{}", not_found_message(.name))]
    DeviceNotFound { name: Option<String> },

    #[error("BLE scan failed: {0}")]
    ScanBackend(String),

    #[error("failed to connect to {address} after {attempts} attempt(s)")]
    ConnectFailure { address: String, attempts: u32 },

    /// Raised inside the sample router and handled there.
    #[error("malformed sample batch: {0}")]
    MalformedBatch(String),

    #[error("backend '{backend}' requires {parameter}")]
    MissingParameter {
        backend: &'static str,
        parameter: &'static str,
    },

    #[error("backend '{0}' is not available on this host")]
    UnsupportedBackend(String),

    #[error("unknown backend '{0}' (expected auto, gatt, native, bgapi or bluemuse)")]
    UnknownBackend(String),

    #[error("data bus error: {0}")]
    Bus(String),

    #[error(transparent)]
    Ble(#[from] btleplug::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn not_found_message(name: &Option<String>) -> String {
    match name {
        Some(n) => format!("no Muse named '{n}' was found"),
        None => "no Muse device found".to_string(),
    }
}
