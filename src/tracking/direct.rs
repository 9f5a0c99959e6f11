//! Same-resolution fast path.
//!
//! When the live frame has exactly the reference dimensions, the annotation
//! coordinates are trusted as-is and only nudged by a small local template
//! search. Feature matching is skipped entirely: reference and live images may
//! come from different cameras, where ORB correspondences are unreliable.

use nalgebra::Point2;
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::DirectPlacementConfig;
use crate::tracking::template::{search_patch, PatchSearch};

/// Outcome for one keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// Moved to a confident local match.
    Refined(Point2<f64>),
    /// Raw annotation coordinate kept.
    Raw(Point2<f64>),
}

impl Placement {
    pub fn position(&self) -> Point2<f64> {
        match self {
            Placement::Refined(p) | Placement::Raw(p) => *p,
        }
    }

    pub fn is_refined(&self) -> bool {
        matches!(self, Placement::Refined(_))
    }
}

const METHODS: [i32; 1] = [imgproc::TM_CCOEFF_NORMED];

pub struct DirectPlacementRefiner {
    config: DirectPlacementConfig,
}

impl DirectPlacementRefiner {
    pub fn new(config: DirectPlacementConfig) -> Self {
        Self { config }
    }

    /// True when the fast path applies.
    pub fn applies(reference: &Mat, live: &Mat) -> bool {
        reference.cols() == live.cols() && reference.rows() == live.rows()
    }

    /// Refine every keypoint. Never fails: any problem keeps the raw coordinate.
    pub fn refine(&self, reference: &Mat, live: &Mat, keypoints: &[Point2<f64>]) -> Vec<Placement> {
        keypoints.iter().map(|kp| self.refine_one(reference, live, kp)).collect()
    }

    fn refine_one(&self, reference: &Mat, live: &Mat, kp: &Point2<f64>) -> Placement {
        let (x, y) = (kp.x as i32, kp.y as i32);
        let raw = Point2::new(x as f64, y as f64);
        if x <= 0 || y <= 0 || x >= live.cols() || y >= live.rows() {
            return Placement::Raw(raw);
        }

        let search = PatchSearch {
            anchor: (x, y),
            patch_size: self.config.patch_size,
            min_patch: self.config.min_patch,
            center: (x, y),
            search_half: self.config.search_radius,
            methods: &METHODS,
        };
        match search_patch(reference, live, &search) {
            Ok(m) if self.accepts(&raw, &m.position, m.score) => Placement::Refined(m.position),
            _ => Placement::Raw(raw),
        }
    }

    /// Acceptance rule: correlation strictly above threshold and a small move on both axes.
    pub fn accepts(&self, raw: &Point2<f64>, refined: &Point2<f64>, score: f64) -> bool {
        score > self.config.correlation_threshold
            && (refined.x - raw.x).abs() < self.config.max_displacement
            && (refined.y - raw.y).abs() < self.config.max_displacement
    }
}
