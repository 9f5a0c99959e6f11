use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use garment_qc::camera::{init_with_retry, CameraSource, FrameSource, ImageSequenceSource, ThreadedSource};
use garment_qc::config::{EngineConfig, SourceConfig, WorkerConfig};
use garment_qc::error::SessionError;
use garment_qc::reference::{Calibration, ReferenceModel, ReferenceSide, Side};
use garment_qc::system::{run_measurement_loop, MeasurementSession, SharedState};

fn load_references(worker: &WorkerConfig, corner_count: usize) -> Result<ReferenceModel> {
    let mut model = ReferenceModel::default();
    // The primary annotation belongs to the side the orchestrator asked for.
    model.insert(
        ReferenceSide::load(
            worker.side,
            &worker.annotation_json_path,
            &worker.reference_image_path,
            corner_count,
        )
        .with_context(|| format!("loading {} reference", worker.side))?,
    );

    let other = worker.side.other();
    match (&worker.other_annotation_json_path, &worker.other_reference_image_path) {
        (Some(annotation), Some(image)) => match ReferenceSide::load(other, annotation, image, corner_count) {
            Ok(reference) => model.insert(reference),
            Err(e) => warn!("{} reference not loaded, side switching disabled: {}", other, e),
        },
        _ => info!("No {} reference configured", other),
    }
    Ok(model)
}

fn load_calibration(path: Option<&Path>) -> Calibration {
    let Some(path) = path else {
        return Calibration::uncalibrated();
    };
    match Calibration::load(path) {
        Ok(calibration) => {
            info!(
                "Calibration: {:.3} px/cm (reference {:.1} cm)",
                calibration.pixels_per_cm, calibration.reference_length_cm
            );
            calibration
        }
        Err(SessionError::CalibrationMissing(p)) => {
            warn!("Calibration file {} not found", p.display());
            Calibration::uncalibrated()
        }
        Err(e) => {
            warn!("Calibration unreadable: {}", e);
            Calibration::uncalibrated()
        }
    }
}

fn open_source(source: &SourceConfig, frame_period: Duration) -> Result<Box<dyn FrameSource>> {
    Ok(match source {
        SourceConfig::Camera { index } => Box::new(CameraSource::new(*index)),
        SourceConfig::Sequence { path } => Box::new(
            ImageSequenceSource::open(path)
                .with_context(|| format!("opening image sequence {}", path.display()))?
                .with_frame_period(frame_period),
        ),
    })
}

/// Line commands on stdin: `pause`, `resume`, `front`, `back`, `stop`.
fn spawn_command_reader(shared: Arc<SharedState>) {
    let spawned = thread::Builder::new()
        .name("commands".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "pause" => shared.set_paused(true),
                    "resume" => shared.set_paused(false),
                    "front" => shared.request_side(Side::Front),
                    "back" => shared.request_side(Side::Back),
                    "stop" | "quit" => {
                        shared.request_shutdown();
                        break;
                    }
                    "" => {}
                    other => warn!("Unknown command: {}", other),
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Command reader not started: {}", e);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "measurement_config.json".to_string());
    let worker = WorkerConfig::from_json(&config_path)
        .with_context(|| format!("reading worker config {}", config_path))?;
    info!(
        "Measurement worker: {} ({}), {} side",
        worker.annotation_name, worker.article_style, worker.side
    );

    let engine_config = match &worker.engine_config_path {
        Some(path) => EngineConfig::from_yaml(path)
            .with_context(|| format!("reading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let calibration = load_calibration(worker.calibration_path.as_deref());
    let references = load_references(&worker, engine_config.corners.corner_count)?;

    let mut session = MeasurementSession::new(
        &engine_config,
        &worker.annotation_name,
        references,
        calibration,
        worker.side,
        worker.live_snapshot_path(),
    )?;

    let loop_config = &engine_config.run_loop;
    let inner = open_source(&worker.source, Duration::from_millis(loop_config.transfer_interval_ms))?;
    let mut source = ThreadedSource::new(inner);
    init_with_retry(
        &mut source,
        loop_config.camera_init_attempts,
        Duration::from_millis(loop_config.camera_retry_backoff_ms),
    )?;

    let shared = SharedState::new();
    spawn_command_reader(Arc::clone(&shared));

    let stats = run_measurement_loop(&mut source, &mut session, &shared, loop_config);
    info!(
        "Done: {} frames, {} measurement updates, {} grab timeouts, {} pauses",
        stats.frames, stats.transfers, stats.timeouts, stats.pauses
    );
    Ok(())
}
