//! Per-session context: references, calibration, active side and tracking memory.

use std::path::PathBuf;

use opencv::core::Mat;
use opencv::prelude::*;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{report_failure, FailureKind, RateLimiter, Result, SessionError};
use crate::measurement::{LiveSnapshot, LiveStateWriter, MeasurementEngine, MeasurementRecord};
use crate::reference::{Calibration, ReferenceModel, Side};
use crate::tracking::{KeypointTracker, TrackingState};

/// One measurement session.
///
/// Owned by the measurement loop; nothing here is shared across threads.
pub struct MeasurementSession {
    annotation_name: String,
    references: ReferenceModel,
    calibration: Calibration,
    active: Side,
    state: TrackingState,
    tracker: KeypointTracker,
    engine: MeasurementEngine,
    limiter: RateLimiter<FailureKind>,
    writer: LiveStateWriter,
    last_measurements: Vec<MeasurementRecord>,
    last_frame: Option<Mat>,
    last_snapshot: Option<LiveSnapshot>,
}

impl MeasurementSession {
    pub fn new(
        config: &EngineConfig,
        annotation_name: &str,
        references: ReferenceModel,
        calibration: Calibration,
        active: Side,
        snapshot_path: PathBuf,
    ) -> Result<Self> {
        if !references.has(active) {
            return Err(SessionError::SideNotLoaded(active));
        }
        if !calibration.is_calibrated {
            warn!("No calibration: reporting pixel distances only, QC disabled");
        }

        Ok(Self {
            annotation_name: annotation_name.to_string(),
            references,
            calibration,
            active,
            state: TrackingState::new(),
            tracker: KeypointTracker::new(config.clone())?,
            engine: MeasurementEngine::new(config.qc.tolerance_cm),
            limiter: RateLimiter::new(config.run_loop.error_report_limit),
            writer: LiveStateWriter::new(snapshot_path, u64::from(config.run_loop.snapshot_every_ticks)),
            last_measurements: Vec::new(),
            last_frame: None,
            last_snapshot: None,
        })
    }

    pub fn active_side(&self) -> Side {
        self.active
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn tracking_state(&self) -> &TrackingState {
        &self.state
    }

    /// Measurements from the last processed frame.
    pub fn measurements(&self) -> &[MeasurementRecord] {
        &self.last_measurements
    }

    /// Last frame handed to [`update`](Self::update); kept across pauses.
    pub fn last_frame(&self) -> Option<&Mat> {
        self.last_frame.as_ref()
    }

    /// Switch the active side. Returns false (and keeps the current side)
    /// when the requested side has no reference loaded.
    pub fn switch_side(&mut self, side: Side) -> bool {
        if side == self.active {
            return true;
        }
        if !self.references.has(side) {
            warn!("Cannot switch to {} side: no reference loaded", side);
            return false;
        }
        info!("Switching {} -> {} side", self.active, side);
        self.active = side;
        self.state.reset();
        self.tracker.invalidate_reference();
        self.limiter.reset();
        self.last_measurements.clear();
        true
    }

    /// Log a loop-level failure through the session's rate limiter.
    pub fn report(&mut self, kind: FailureKind, detail: &str) {
        report_failure(&mut self.limiter, kind, detail);
    }

    /// Re-localize keypoints in `live` and measure every pair.
    pub fn update(&mut self, live: Mat) -> Result<LiveSnapshot> {
        let side = self.active;
        let reference = self
            .references
            .get_mut(side)
            .ok_or(SessionError::SideNotLoaded(side))?;

        let result = self.tracker.process_frame(reference, &live, &mut self.state);
        for kind in &result.failures {
            report_failure(
                &mut self.limiter,
                *kind,
                &format!("{} side, {} matches", side, result.metrics.n_matches),
            );
        }

        let (records, new_baseline) =
            self.engine
                .measure(reference, &self.calibration, &result.keypoints, (live.cols(), live.rows()));
        if new_baseline {
            match reference.save_annotation() {
                Ok(()) => info!("{} side: baseline targets saved", side),
                Err(e) => warn!("{} side: failed to persist baseline: {}", side, e),
            }
        }

        let snapshot = LiveSnapshot::new(
            &self.annotation_name,
            side,
            &self.calibration,
            self.engine.tolerance_cm(),
            result.is_stabilized,
            &records,
        );

        self.last_measurements = records;
        self.last_frame = Some(live);
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Advance the snapshot throttle by one loop tick; writes the most recent
    /// snapshot when due. Ticks independently of transfer runs.
    pub fn tick_snapshot(&mut self) {
        if !self.writer.tick() {
            return;
        }
        let Some(snapshot) = &self.last_snapshot else {
            return;
        };
        if let Err(e) = self.writer.write(snapshot) {
            warn!("Failed to write live snapshot {}: {}", self.writer.path().display(), e);
        }
    }

    pub fn snapshots_written(&self) -> u64 {
        self.writer.written()
    }
}
