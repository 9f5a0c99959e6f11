//! The cooperative measurement loop.
//!
//! Each tick: honor side/pause/stop requests, grab the latest frame, run the
//! transfer pipeline when the cadence allows, and advance the snapshot
//! throttle. The loop only exits on a stop request or when a finite source
//! runs dry.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::camera::{ensure_grayscale, FrameSource};
use crate::config::LoopConfig;
use crate::error::FailureKind;
use crate::system::session::MeasurementSession;
use crate::system::shared_state::SharedState;

const PAUSE_POLL: Duration = Duration::from_millis(20);

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub transfers: u64,
    pub timeouts: u64,
    pub pauses: u64,
}

pub fn run_measurement_loop(
    source: &mut dyn FrameSource,
    session: &mut MeasurementSession,
    shared: &SharedState,
    config: &LoopConfig,
) -> LoopStats {
    let grab_timeout = Duration::from_millis(config.grab_timeout_ms);
    let interval = Duration::from_millis(config.transfer_interval_ms);
    let mut stats = LoopStats::default();
    let mut last_transfer: Option<Instant> = None;
    let mut paused = false;

    info!("Measurement loop started on {} side", session.active_side());
    while !shared.is_shutdown_requested() {
        if let Some(side) = shared.take_side_request() {
            if session.switch_side(side) {
                last_transfer = None;
            }
        }

        // Paused: acquisition stops; the last frame and snapshot stay current.
        if shared.is_paused() != paused {
            paused = !paused;
            source.set_paused(paused);
            if paused {
                stats.pauses += 1;
            }
            info!("Measurement {}", if paused { "paused" } else { "resumed" });
        }
        if paused {
            thread::sleep(PAUSE_POLL);
            continue;
        }

        if source.is_exhausted() {
            info!("Frame source exhausted");
            break;
        }

        let Some(frame) = source.grab(grab_timeout) else {
            stats.timeouts += 1;
            session.report(
                FailureKind::FrameTimeout,
                &format!("no frame within {} ms", config.grab_timeout_ms),
            );
            continue;
        };
        let gray = match ensure_grayscale(&frame) {
            Ok(gray) => gray,
            Err(e) => {
                session.report(FailureKind::VisionError, &e.to_string());
                continue;
            }
        };
        stats.frames += 1;

        if last_transfer.map_or(true, |t| t.elapsed() >= interval) {
            last_transfer = Some(Instant::now());
            match session.update(gray) {
                Ok(snapshot) => {
                    stats.transfers += 1;
                    shared.publish(snapshot);
                }
                Err(e) => warn!("Measurement update failed: {}", e),
            }
        }
        session.tick_snapshot();
    }

    source.close();
    info!(
        "Measurement loop stopped: {} frames, {} transfers, {} timeouts",
        stats.frames, stats.transfers, stats.timeouts
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use opencv::core::Mat;

    use crate::camera::ThreadedSource;
    use crate::config::EngineConfig;
    use crate::reference::{AnnotationRecord, Calibration, ReferenceModel, ReferenceSide, Side};
    use crate::tracking::test_support::blocky_texture;

    struct ScriptedSource {
        frames: Vec<Mat>,
        closed: bool,
    }

    impl FrameSource for ScriptedSource {
        fn init(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn grab(&mut self, _timeout: Duration) -> Option<Mat> {
            if self.frames.is_empty() {
                None
            } else {
                Some(self.frames.remove(0))
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_exhausted(&self) -> bool {
            self.frames.is_empty()
        }
    }

    /// Endless source that counts how often it is read.
    struct CountingSource {
        grabs: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn init(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn grab(&mut self, _timeout: Duration) -> Option<Mat> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            Some(blocky_texture(320, 240, 3))
        }

        fn close(&mut self) {}
    }

    /// Pauses the loop for a short while right after handing out its second frame.
    struct PausingSource {
        frames: Vec<Mat>,
        delivered: usize,
        shared: Arc<SharedState>,
    }

    impl FrameSource for PausingSource {
        fn init(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn grab(&mut self, _timeout: Duration) -> Option<Mat> {
            if self.frames.is_empty() {
                return None;
            }
            self.delivered += 1;
            if self.delivered == 2 {
                self.shared.set_paused(true);
                let resumer = Arc::clone(&self.shared);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(60));
                    resumer.set_paused(false);
                });
            }
            Some(self.frames.remove(0))
        }

        fn close(&mut self) {}

        fn is_exhausted(&self) -> bool {
            self.frames.is_empty()
        }
    }

    fn session(dir: &tempfile::TempDir) -> MeasurementSession {
        session_with(dir, EngineConfig::default())
    }

    fn session_with(dir: &tempfile::TempDir, config: EngineConfig) -> MeasurementSession {
        let record = AnnotationRecord::new(vec![[60.0, 60.0], [200.0, 60.0]]);
        let mut model = ReferenceModel::default();
        model.insert(ReferenceSide::from_record(Side::Front, blocky_texture(320, 240, 3), record, 2).unwrap());
        MeasurementSession::new(
            &config,
            "tee",
            model,
            Calibration::uncalibrated(),
            Side::Front,
            dir.path().join("live.json"),
        )
        .unwrap()
    }

    fn fast_loop() -> LoopConfig {
        LoopConfig {
            grab_timeout_ms: 10,
            transfer_interval_ms: 0,
            ..LoopConfig::default()
        }
    }

    #[test]
    fn runs_until_source_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(&dir);
        let shared = SharedState::new();
        let mut source = ScriptedSource {
            frames: (0..3).map(|_| blocky_texture(320, 240, 3)).collect(),
            closed: false,
        };

        let stats = run_measurement_loop(&mut source, &mut s, &shared, &fast_loop());
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.transfers, 3);
        assert!(source.closed);

        let latest = shared.latest_snapshot().unwrap();
        assert_eq!(latest.measurements.len(), 1);
        assert_eq!(latest.measurements[0].pixel_distance, 140.0);
    }

    #[test]
    fn transfer_cadence_skips_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(&dir);
        let shared = SharedState::new();
        let mut source = ScriptedSource {
            frames: (0..4).map(|_| blocky_texture(320, 240, 3)).collect(),
            closed: false,
        };
        let config = LoopConfig {
            transfer_interval_ms: 60_000,
            ..fast_loop()
        };

        let stats = run_measurement_loop(&mut source, &mut s, &shared, &config);
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.transfers, 1);
    }

    #[test]
    fn stop_request_exits_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(&dir);
        let shared = SharedState::new();
        shared.set_paused(true);
        let mut source = ScriptedSource {
            frames: vec![blocky_texture(320, 240, 3)],
            closed: false,
        };

        let stopper = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.request_shutdown();
        });
        let stats = run_measurement_loop(&mut source, &mut s, &shared, &fast_loop());
        handle.join().unwrap();

        assert_eq!(stats.frames, 0);
        assert_eq!(source.frames.len(), 1);
        assert!(source.closed);
    }

    #[test]
    fn pause_stops_the_grabber_thread() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(&dir);
        let shared = SharedState::new();
        let grabs = Arc::new(AtomicUsize::new(0));
        let mut source = ThreadedSource::new(Box::new(CountingSource {
            grabs: Arc::clone(&grabs),
        }));
        source.init().unwrap();
        shared.set_paused(true);

        let stopper = Arc::clone(&shared);
        let counter = Arc::clone(&grabs);
        let handle = thread::spawn(move || {
            // Give the loop time to forward the pause and the grabber time to see it.
            thread::sleep(Duration::from_millis(100));
            let settled = counter.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            let later = counter.load(Ordering::SeqCst);
            stopper.request_shutdown();
            later - settled
        });
        let stats = run_measurement_loop(&mut source, &mut s, &shared, &fast_loop());
        let grabbed_while_paused = handle.join().unwrap();

        assert_eq!(grabbed_while_paused, 0);
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.pauses, 1);
    }

    #[test]
    fn resume_keeps_stabilization_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(&dir);
        let shared = SharedState::new();
        let mut source = PausingSource {
            frames: (0..3).map(|_| blocky_texture(320, 240, 3)).collect(),
            delivered: 0,
            shared: Arc::clone(&shared),
        };

        let stats = run_measurement_loop(&mut source, &mut s, &shared, &fast_loop());
        assert_eq!(stats.pauses, 1);
        assert_eq!(stats.transfers, 3);
        // First frame initializes, the next two (one on each side of the pause) count as stable.
        assert_eq!(s.tracking_state().consecutive_stable_frames, 2);
        assert!(s.tracking_state().is_stabilized);
    }

    #[test]
    fn snapshots_follow_loop_ticks_not_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.run_loop.snapshot_every_ticks = 2;
        let mut s = session_with(&dir, config);
        let shared = SharedState::new();
        let mut source = ScriptedSource {
            frames: (0..6).map(|_| blocky_texture(320, 240, 3)).collect(),
            closed: false,
        };
        let loop_config = LoopConfig {
            transfer_interval_ms: 60_000,
            ..fast_loop()
        };

        let stats = run_measurement_loop(&mut source, &mut s, &shared, &loop_config);
        assert_eq!(stats.transfers, 1);
        assert_eq!(s.snapshots_written(), 3);
        assert!(dir.path().join("live.json").exists());
    }
}
