//! Fans decoded batches out to a modality's outlet, one push per sample.
//!
//! Routing never fails outward. A batch that is malformed, or whose very
//! first push is rejected, gets one degraded retry (the first sample,
//! stamped explicitly). A batch that fails part way keeps what it already
//! pushed and drops the rest. Losing samples is acceptable, ending the
//! session is not.

use std::sync::{Arc, PoisonError};

use log::{debug, trace};

use crate::assemble::Clock;
use crate::backend::SampleCallback;
use crate::error::{Error, Result};
use crate::outlet::{Outlet, SharedOutlet};
use crate::supervisor::Liveness;
use crate::types::{Modality, SampleBatch};

/// Publishes one modality's batches onto its outlet.
pub struct SampleRouter {
    modality: Modality,
    outlet: SharedOutlet,
    liveness: Liveness,
    clock: Clock,
}

impl SampleRouter {
    pub fn new(modality: Modality, outlet: SharedOutlet, liveness: Liveness) -> Self {
        Self {
            modality,
            outlet,
            liveness,
            clock: Clock::default(),
        }
    }

    /// Time base for the degraded push's fallback stamp.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// A session callback bound to this router and nothing else.
    pub fn into_callback(self) -> SampleCallback {
        let router = Arc::new(self);
        Box::new(move |batch| router.route(batch))
    }

    /// Publish `batch`. Never panics, never returns an error.
    pub fn route(&self, batch: SampleBatch) {
        self.liveness.touch();

        let mut outlet = self.outlet.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pushed = 0;
        let Err(e) = dispatch(&mut **outlet, &batch, &mut pushed) else {
            return;
        };
        if pushed > 0 {
            trace!("{} router: dropped rest of batch after {pushed} samples: {e}", self.modality);
            return;
        }
        debug!("{} router: {e}; trying degraded push", self.modality);
        if let Err(e) = degraded_push(&mut **outlet, &batch, self.clock) {
            trace!("{} router: dropped batch: {e}", self.modality);
        }
    }
}

fn column(rows: &[Vec<f32>], i: usize) -> Option<Vec<f32>> {
    rows.iter().map(|row| row.get(i).copied()).collect()
}

/// Checks a matrix is non-empty and rectangular; returns its column count.
fn matrix_width(rows: &[Vec<f32>]) -> Result<usize> {
    let width = rows
        .first()
        .map(Vec::len)
        .ok_or_else(|| Error::MalformedBatch("matrix has no channels".into()))?;
    if rows.iter().any(|r| r.len() != width) {
        return Err(Error::MalformedBatch("ragged matrix".into()));
    }
    Ok(width)
}

/// Push every sample in order, counting successes into `pushed`.
fn dispatch(outlet: &mut dyn Outlet, batch: &SampleBatch, pushed: &mut usize) -> Result<()> {
    match batch {
        SampleBatch::Matrix { rows, timestamps } => {
            let width = matrix_width(rows)?;
            for i in 0..width {
                let sample = column(rows, i)
                    .ok_or_else(|| Error::MalformedBatch(format!("column {i} missing")))?;
                outlet.push_sample(&sample, timestamps.get(i).copied())?;
                *pushed += 1;
            }
            Ok(())
        }
        SampleBatch::Single { sample, timestamp } => {
            outlet.push_sample(sample, *timestamp)?;
            *pushed += 1;
            Ok(())
        }
        SampleBatch::Samples {
            samples,
            timestamps,
        } => {
            for (i, sample) in samples.iter().enumerate() {
                outlet.push_sample(sample, timestamps.get(i).copied())?;
                *pushed += 1;
            }
            Ok(())
        }
    }
}

/// Push only the first sample, with an explicit timestamp (the batch's own
/// first timestamp, else `clock`).
fn degraded_push(outlet: &mut dyn Outlet, batch: &SampleBatch, clock: Clock) -> Result<()> {
    let (sample, timestamp) = match batch {
        SampleBatch::Matrix { rows, timestamps } => (column(rows, 0), timestamps.first().copied()),
        SampleBatch::Samples {
            samples,
            timestamps,
        } => (samples.first().cloned(), timestamps.first().copied()),
        SampleBatch::Single { sample, timestamp } => (Some(sample.clone()), *timestamp),
    };
    let sample = sample
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedBatch("no first sample".into()))?;
    outlet.push_sample(&sample, Some(timestamp.unwrap_or_else(|| clock.now())))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Pushes = Arc<Mutex<Vec<(Vec<f32>, Option<f64>)>>>;

    /// Records pushes; rejects samples whose length differs from `arity`.
    struct Recorder {
        arity: usize,
        pushes: Pushes,
    }

    impl Outlet for Recorder {
        fn push_sample(&mut self, sample: &[f32], timestamp: Option<f64>) -> Result<()> {
            if sample.len() != self.arity {
                return Err(Error::Bus("arity".into()));
            }
            self.pushes.lock().unwrap().push((sample.to_vec(), timestamp));
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn router(arity: usize) -> (SampleRouter, Pushes, Liveness) {
        let pushes = Pushes::default();
        let recorder: Box<dyn Outlet> = Box::new(Recorder {
            arity,
            pushes: Arc::clone(&pushes),
        });
        let outlet: SharedOutlet = Arc::new(Mutex::new(recorder));
        let liveness = Liveness::new();
        (
            SampleRouter::new(Modality::Eeg, outlet, liveness.clone()),
            pushes,
            liveness,
        )
    }

    #[tokio::test]
    async fn matrix_pushes_one_sample_per_column() {
        let (router, pushes, _) = router(2);
        router.route(SampleBatch::Matrix {
            rows: vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
            timestamps: vec![10.0, 10.5, 11.0],
        });
        let pushes = pushes.lock().unwrap();
        assert_eq!(pushes.len(), 3);
        assert_eq!(pushes[0], (vec![1.0, 4.0], Some(10.0)));
        assert_eq!(pushes[2], (vec![3.0, 6.0], Some(11.0)));
    }

    #[tokio::test]
    async fn short_timestamps_leave_tail_unstamped() {
        let (router, pushes, _) = router(2);
        router.route(SampleBatch::Matrix {
            rows: vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]],
            timestamps: vec![1.0],
        });
        let stamps: Vec<_> = pushes.lock().unwrap().iter().map(|p| p.1).collect();
        assert_eq!(stamps, vec![Some(1.0), None, None, None]);
    }

    #[tokio::test]
    async fn single_and_sequence_batches() {
        let (router, pushes, _) = router(3);
        router.route(SampleBatch::Single {
            sample: vec![1.0, 2.0, 3.0],
            timestamp: Some(7.0),
        });
        router.route(SampleBatch::Samples {
            samples: vec![vec![0.0; 3], vec![1.0; 3]],
            timestamps: vec![8.0],
        });
        let pushes = pushes.lock().unwrap();
        assert_eq!(pushes.len(), 3);
        assert_eq!(pushes[0].1, Some(7.0));
        assert_eq!(pushes[1].1, Some(8.0));
        assert_eq!(pushes[2].1, None);
    }

    #[tokio::test]
    async fn ragged_matrix_falls_back_to_first_column() {
        let (router, pushes, _) = router(2);
        router.route(SampleBatch::Matrix {
            rows: vec![vec![1.0, 2.0], vec![3.0]],
            timestamps: vec![],
        });
        let pushes = pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, vec![1.0, 3.0]);
        assert!(pushes[0].1.is_some());
    }

    #[tokio::test]
    async fn partial_failure_keeps_pushed_samples_without_fallback() {
        let (router, pushes, _) = router(2);
        router.route(SampleBatch::Samples {
            samples: vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0]],
            timestamps: vec![5.0, 6.0, 7.0],
        });
        let pushes = pushes.lock().unwrap();
        assert_eq!(
            *pushes,
            vec![(vec![1.0, 1.0], Some(5.0)), (vec![2.0, 2.0], Some(6.0))]
        );
    }

    #[tokio::test]
    async fn degraded_push_stamps_with_the_configured_clock() {
        let (router, pushes, _) = router(2);
        let router = router.with_clock(Clock::Bus);
        router.route(SampleBatch::Matrix {
            rows: vec![vec![1.0, 2.0], vec![3.0]],
            timestamps: vec![],
        });
        let stamp = pushes.lock().unwrap()[0].1.unwrap();
        assert!(stamp < 1.0e8, "expected a bus clock reading, got {stamp}");
    }

    #[tokio::test]
    async fn unusable_batch_is_dropped_silently() {
        let (router, pushes, liveness) = router(5);
        router.route(SampleBatch::Matrix {
            rows: vec![],
            timestamps: vec![],
        });
        router.route(SampleBatch::Single {
            sample: vec![1.0],
            timestamp: None,
        });
        assert!(pushes.lock().unwrap().is_empty());
        assert!(liveness.last().is_some());
    }

    #[tokio::test]
    async fn callback_routes_through_the_bound_outlet() {
        let (router, pushes, _) = router(1);
        let callback = router.into_callback();
        callback(SampleBatch::Single {
            sample: vec![4.2],
            timestamp: None,
        });
        assert_eq!(pushes.lock().unwrap().len(), 1);
    }
}
