//! Error taxonomy.
//!
//! Two layers:
//! - [`SessionError`]: startup and I/O failures that abort a session (or a side).
//! - [`FailureKind`]: recoverable per-frame / per-keypoint outcomes. These never
//!   unwind past the frame boundary; they are carried as data and reported
//!   through a [`RateLimiter`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable after {attempts} attempt(s): {reason}")]
    CameraUnavailable { attempts: u32, reason: String },

    #[error("annotation {path:?} missing or corrupt: {reason}")]
    AnnotationMissingOrCorrupt { path: PathBuf, reason: String },

    #[error("reference image {0:?} could not be read")]
    ReferenceImageUnreadable(PathBuf),

    #[error("calibration {0:?} missing")]
    CalibrationMissing(PathBuf),

    #[error("side {0} has no reference loaded")]
    SideNotLoaded(crate::reference::Side),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("OpenCV error: {0}")]
    Vision(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Recoverable failure of one estimator for one frame or keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No frame arrived within the grab timeout.
    FrameTimeout,
    /// Detector/descriptor returned nothing usable.
    FeatureExtractionFailure,
    /// Too few ratio-test survivors for the requested transfer.
    InsufficientMatches,
    /// Homography rejected by the determinant check (or not estimable).
    HomographyDegenerate,
    /// Correlation peak below the acceptance threshold.
    TemplateBelowThreshold,
    /// Patch or search window clipped below its minimum size.
    WindowOutOfBounds,
    /// An OpenCV call failed for this keypoint.
    VisionError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::FrameTimeout => "frame timeout",
            FailureKind::FeatureExtractionFailure => "feature extraction failure",
            FailureKind::InsufficientMatches => "insufficient matches",
            FailureKind::HomographyDegenerate => "degenerate homography",
            FailureKind::TemplateBelowThreshold => "template below threshold",
            FailureKind::WindowOutOfBounds => "window out of bounds",
            FailureKind::VisionError => "vision error",
        };
        write!(f, "{}", s)
    }
}

/// Caps how many times an identical error is reported.
///
/// `should_report` returns true for the first `limit` occurrences of a key,
/// false afterwards.
#[derive(Debug, Clone)]
pub struct RateLimiter<K> {
    limit: u32,
    counts: HashMap<K, u32>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    pub fn should_report(&mut self, key: K) -> bool {
        let count = self.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count <= self.limit
    }

    /// True when the most recent report for `key` was the last one allowed.
    pub fn is_last_report(&self, key: &K) -> bool {
        self.counts.get(key).copied() == Some(self.limit)
    }

    pub fn occurrences(&self, key: &K) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

/// Logs a per-frame failure through the limiter.
pub fn report_failure(limiter: &mut RateLimiter<FailureKind>, kind: FailureKind, detail: &str) {
    if limiter.should_report(kind) {
        if limiter.is_last_report(&kind) {
            tracing::warn!("{}: {} (further reports suppressed)", kind, detail);
        } else {
            tracing::warn!("{}: {}", kind, detail);
        }
    }
}
