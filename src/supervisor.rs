//! The streaming supervisor: a cooperative polling loop that decides when a
//! live session should stop.
//!
//! The loop never tears anything down itself. It returns a [`StopReason`] and
//! the session controller runs the same teardown whatever the reason.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

/// Seconds without a sample before a connected link counts as stale.
pub const AUTO_DISCONNECT_DELAY: Duration = Duration::from_secs(3);

/// Longest a connected session may stay silent before its first sample.
pub const SILENT_CONNECT_LIMIT: Duration = Duration::from_secs(300);

/// Sleep between liveness checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

// ── Liveness ──────────────────────────────────────────────────────────────────

/// "Last sample received" marker shared between sample callbacks (writers)
/// and the supervisor (reader).
///
/// Stored as microseconds after a fixed epoch; `0` means no sample yet.
#[derive(Clone, Debug)]
pub struct Liveness {
    epoch: Instant,
    last_micros: Arc<AtomicU64>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record that a sample arrived now.
    pub fn touch(&self) {
        let micros = self.epoch.elapsed().as_micros() as u64 + 1;
        self.last_micros.store(micros, Ordering::Release);
    }

    /// When the most recent sample arrived, if any ever did.
    pub fn last(&self) -> Option<Instant> {
        match self.last_micros.load(Ordering::Acquire) {
            0 => None,
            micros => Some(self.epoch + Duration::from_micros(micros - 1)),
        }
    }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Cancellation shared between the operator (Ctrl-C) and the supervisor.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Policy & loop ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    /// Stop once the newest sample is older than this.
    pub stale_after: Duration,
    /// Stop if no sample has ever arrived after this long.
    pub silent_limit: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            stale_after: AUTO_DISCONNECT_DELAY,
            silent_limit: SILENT_CONNECT_LIMIT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Why a streaming session ended. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Samples stopped arriving for longer than `stale_after`.
    StaleLink,
    /// Connected, but no sample ever arrived within `silent_limit`.
    SilentConnect,
    /// The operator interrupted the stream.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StaleLink => f.write_str("no data received"),
            StopReason::SilentConnect => f.write_str("maximum silent time reached"),
            StopReason::Cancelled => f.write_str("interrupted by user"),
        }
    }
}

/// Run until the link goes stale, stays silent too long, or `cancel` fires.
///
/// Both timeout checks are kept. The silence check can only fire while no
/// sample has ever arrived, so once streaming starts only the stale-link
/// check applies.
pub async fn supervise(liveness: &Liveness, cancel: &CancelToken, policy: &SupervisorPolicy) -> StopReason {
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return StopReason::Cancelled;
        }

        let now = Instant::now();
        match liveness.last() {
            Some(last) if now.saturating_duration_since(last) > policy.stale_after => {
                info!(
                    "Auto-disconnect after {:?} of no data",
                    now.saturating_duration_since(last)
                );
                return StopReason::StaleLink;
            }
            None if now.saturating_duration_since(started) > policy.silent_limit => {
                info!("No data within {:?} of connecting", policy.silent_limit);
                return StopReason::SilentConnect;
            }
            _ => {}
        }

        tokio::select! {
            _ = sleep(policy.poll_interval) => {}
            _ = cancel.cancelled() => {
                debug!("supervisor: cancellation observed while sleeping");
                return StopReason::Cancelled;
            }
        }
    }
}
