//! Engine configuration.
//!
//! Every empirically tuned threshold lives here. `EngineConfig::default()`
//! reproduces the station's calibrated behavior; a YAML file may override any
//! subset of fields.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reference::Side;

/// Top-level configuration for one measurement session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub features: FeatureConfig,
    pub transfer: TransferConfig,
    pub template: TemplateConfig,
    pub corners: CornerConfig,
    pub direct: DirectPlacementConfig,
    pub fusion: FusionConfig,
    pub stabilization: StabilizationConfig,
    pub qc: QcConfig,
    pub run_loop: LoopConfig,
}

impl EngineConfig {
    /// Load from a YAML file. Missing fields fall back to defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: EngineConfig = serde_yaml::from_reader(file)?;
        Ok(config)
    }
}

/// ORB extraction and descriptor matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Maximum number of ORB features per image.
    pub n_features: i32,
    /// Images are downsized so their longer side is at most this many pixels.
    pub max_dimension: i32,
    /// Lowe ratio test threshold (best / second best).
    pub ratio: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            n_features: 3500,
            max_dimension: 800,
            ratio: 0.75,
        }
    }
}

/// Geometric transfer (homography / MLS) and scale estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Floor for a homography fit, and the "healthy" match count for fusion weighting.
    pub min_matches: usize,
    /// Match count at which a homography is attempted instead of MLS.
    pub homography_min_matches: usize,
    /// Minimum matches for the MLS fallback.
    pub mls_min_matches: usize,
    /// RANSAC reprojection threshold in pixels.
    pub ransac_reproj_threshold: f64,
    /// Accepted open interval for |det(H)|.
    pub det_min: f64,
    pub det_max: f64,
    /// MLS distance exponent.
    pub mls_alpha: f64,
    /// Pairs closer than this in the reference are ignored for scale estimation.
    pub scale_min_pair_distance: f64,
    /// Exponential smoothing factor applied to new scale estimates.
    pub scale_smoothing: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_matches: 15,
            homography_min_matches: 20,
            mls_min_matches: 4,
            ransac_reproj_threshold: 5.0,
            det_min: 0.1,
            det_max: 10.0,
            mls_alpha: 1.0,
            scale_min_pair_distance: 10.0,
            scale_smoothing: 0.3,
        }
    }
}

/// General (regular keypoint) template matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Patch side in pixels at scale 1.0.
    pub patch_size: f64,
    /// Search half-extent as a multiple of the patch side.
    pub search_multiplier: f64,
    /// Minimum accepted TM_CCOEFF_NORMED peak.
    pub threshold: f64,
    /// Minimum patch side after clipping to the image.
    pub min_patch: i32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            patch_size: 85.0,
            search_multiplier: 2.0,
            threshold: 0.70,
            min_patch: 10,
        }
    }
}

/// Corner keypoint refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerConfig {
    /// The first `corner_count` keypoints are treated as corners.
    pub corner_count: usize,
    pub patch_size: f64,
    pub search_multiplier: f64,
    pub template_threshold: f64,
    pub min_patch: i32,
    /// Detector window side at scale 1.0.
    pub window_size: f64,
    /// Minimum window side after clipping.
    pub min_window: i32,
    pub gftt_quality: f64,
    pub gftt_min_distance: f64,
    /// Minimum Harris response accepted as a corner.
    pub harris_threshold: f64,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            corner_count: 12,
            patch_size: 150.0,
            search_multiplier: 2.5,
            template_threshold: 0.60,
            min_patch: 20,
            window_size: 150.0,
            min_window: 50,
            gftt_quality: 0.01,
            gftt_min_distance: 10.0,
            harris_threshold: 0.01,
        }
    }
}

/// Same-resolution fast path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectPlacementConfig {
    pub patch_size: i32,
    pub min_patch: i32,
    pub search_radius: i32,
    /// Correlation must be strictly above this to move a point.
    pub correlation_threshold: f64,
    /// Refinements at or beyond this displacement (per axis) are discarded.
    pub max_displacement: f64,
}

impl Default for DirectPlacementConfig {
    fn default() -> Self {
        Self {
            patch_size: 60,
            min_patch: 20,
            search_radius: 80,
            correlation_threshold: 0.5,
            max_displacement: 60.0,
        }
    }
}

/// Feature/template agreement rules for regular keypoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub agreement_distance: f64,
    pub feature_weight_healthy: f64,
    pub feature_weight_weak: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            agreement_distance: 25.0,
            feature_weight_healthy: 0.7,
            feature_weight_weak: 0.4,
        }
    }
}

/// Temporal jitter rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    /// Jumps up to this many pixels are accepted without corroboration.
    pub jump_threshold: f64,
    /// Other keypoints must move more than this to count as corroborating.
    pub movement_threshold: f64,
    /// Minimum corroborating movements for a coordinated-motion verdict.
    pub min_coordinated: usize,
    /// Mean cosine similarity required for coordinated motion.
    pub cosine_threshold: f64,
    /// Consecutive fully accepted frames before the track is "stabilized".
    pub stable_frames_required: u32,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            jump_threshold: 17.0,
            movement_threshold: 5.0,
            min_coordinated: 2,
            cosine_threshold: 0.7,
            stable_frames_required: 2,
        }
    }
}

/// Quality-check tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Allowed absolute deviation from target in centimeters.
    pub tolerance_cm: f64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self { tolerance_cm: 100.0 }
    }
}

/// Measurement loop cadence and camera start-up policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub grab_timeout_ms: u64,
    /// Minimum spacing between transfer pipeline runs.
    pub transfer_interval_ms: u64,
    /// A snapshot is written every this many active ticks.
    pub snapshot_every_ticks: u32,
    pub camera_init_attempts: u32,
    pub camera_retry_backoff_ms: u64,
    /// Identical per-frame failures are logged at most this many times.
    pub error_report_limit: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            grab_timeout_ms: 200,
            transfer_interval_ms: 60,
            snapshot_every_ticks: 20,
            camera_init_attempts: 3,
            camera_retry_backoff_ms: 500,
            error_report_limit: 3,
        }
    }
}

/// Where live frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// OpenCV capture device index.
    Camera { index: i32 },
    /// Directory containing `data.csv` (`timestamp,filename`) and a `data/` folder.
    Sequence { path: PathBuf },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Camera { index: 0 }
    }
}

/// Hand-off file written by the orchestrator when it starts a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub annotation_name: String,
    #[serde(default)]
    pub article_style: String,
    #[serde(default)]
    pub side: Side,
    pub annotation_json_path: PathBuf,
    pub reference_image_path: PathBuf,
    #[serde(default)]
    pub other_annotation_json_path: Option<PathBuf>,
    #[serde(default)]
    pub other_reference_image_path: Option<PathBuf>,
    #[serde(default)]
    pub calibration_path: Option<PathBuf>,
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
    #[serde(default)]
    pub engine_config_path: Option<PathBuf>,
    #[serde(default)]
    pub source: SourceConfig,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("measurement_results")
}

impl WorkerConfig {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: WorkerConfig = serde_json::from_reader(file)?;
        Ok(config)
    }

    /// Path of the live snapshot artifact.
    pub fn live_snapshot_path(&self) -> PathBuf {
        self.results_path.join("live_measurements.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_override_keeps_unspecified_defaults() {
        let yaml = "qc:\n  tolerance_cm: 5.0\ncorners:\n  corner_count: 8\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.qc.tolerance_cm, 5.0);
        assert_eq!(config.corners.corner_count, 8);
        assert_eq!(config.corners.patch_size, 150.0);
        assert_eq!(config.transfer.min_matches, 15);
        assert_eq!(config.run_loop.transfer_interval_ms, 60);
    }

    #[test]
    fn worker_config_parses_orchestrator_file() {
        let json = r#"{
            "annotation_name": "XXL",
            "article_style": "NKE-TS-001",
            "side": "back",
            "annotation_json_path": "/data/front_annotation.json",
            "reference_image_path": "/data/front_reference.jpg",
            "source": {"kind": "sequence", "path": "/data/replay"}
        }"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.side, Side::Back);
        assert_eq!(config.results_path, PathBuf::from("measurement_results"));
        assert_eq!(
            config.source,
            SourceConfig::Sequence {
                path: PathBuf::from("/data/replay")
            }
        );
        assert!(config.calibration_path.is_none());
        assert_eq!(
            config.live_snapshot_path(),
            PathBuf::from("measurement_results/live_measurements.json")
        );
    }
}
