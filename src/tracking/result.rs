//! Per-frame transfer results and diagnostics.
//!
//! These types describe what happened while re-localizing keypoints in one
//! live frame:
//! - which placement mode ran (direct or feature/template scaling)
//! - the final position of every keypoint and whether it was actually tracked
//! - estimator counts and timing for logging

use nalgebra::Point2;

use crate::error::FailureKind;
use crate::tracking::transfer::TransferMethod;

/// How keypoints were placed for this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// Live and reference dimensions match; annotation refined locally.
    Direct,
    /// Dimensions differ; feature transfer + template + corner fusion.
    Scaling,
}

impl std::fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementMode::Direct => write!(f, "direct placement"),
            PlacementMode::Scaling => write!(f, "scaling"),
        }
    }
}

/// Final state of one keypoint after fusion and stabilization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedKeypoint {
    /// Live-frame position; `None` when nothing could be resolved.
    pub position: Option<Point2<f64>>,
    /// True when the position is a substitute (held, raw annotation, or none).
    pub is_fallback: bool,
}

/// Summary of one transfer run.
pub struct TransferResult {
    pub mode: PlacementMode,
    pub keypoints: Vec<TrackedKeypoint>,
    pub is_stabilized: bool,
    pub metrics: TransferMetrics,
    pub timing: TimingStats,
    /// Frame-level failures worth reporting (rate limited by the caller).
    pub failures: Vec<FailureKind>,
}

impl TransferResult {
    pub fn tracked_count(&self) -> usize {
        self.keypoints.iter().filter(|k| !k.is_fallback).count()
    }
}

/// Estimator counts for one frame.
#[derive(Debug, Clone)]
pub struct TransferMetrics {
    pub n_reference_features: usize,
    pub n_live_features: usize,
    pub n_matches: usize,
    pub method: TransferMethod,
    pub valid_feature: usize,
    pub valid_template: usize,
    pub valid_corner: usize,
    /// Direct mode only: keypoints moved by local refinement.
    pub refined_direct: usize,
    pub scale: f64,
}

impl TransferMetrics {
    pub fn zero() -> Self {
        Self {
            n_reference_features: 0,
            n_live_features: 0,
            n_matches: 0,
            method: TransferMethod::None,
            valid_feature: 0,
            valid_template: 0,
            valid_corner: 0,
            refined_direct: 0,
            scale: 1.0,
        }
    }
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub match_ms: f64,
    pub template_ms: f64,
    pub corner_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self {
            total_ms: 0.0,
            extract_ms: 0.0,
            match_ms: 0.0,
            template_ms: 0.0,
            corner_ms: 0.0,
        }
    }
}
