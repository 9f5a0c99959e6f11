//! Pairwise measurement and tolerance checking.

use std::collections::BTreeMap;

use nalgebra::Point2;
use tracing::info;

use crate::reference::{Calibration, PairIndex, ReferenceSide};
use crate::tracking::TrackedKeypoint;

/// Two consecutive keypoints whose distance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementPair {
    pub index: PairIndex,
    pub first: usize,
    pub second: usize,
}

/// Pairs (0,1), (2,3), ... An odd trailing keypoint is not paired.
pub fn pairs(n_keypoints: usize) -> Vec<MeasurementPair> {
    (0..n_keypoints / 2)
        .map(|i| MeasurementPair {
            index: PairIndex::from_first_keypoint(2 * i),
            first: 2 * i,
            second: 2 * i + 1,
        })
        .collect()
}

/// Euclidean pixel distance of a pair. `None` if either index is out of range.
pub fn pair_distance(points: &[Point2<f64>], pair: &MeasurementPair) -> Option<f64> {
    let a = points.get(pair.first)?;
    let b = points.get(pair.second)?;
    Some((b - a).norm())
}

/// Result of one QC check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QcVerdict {
    pub passed: bool,
    pub target_cm: f64,
    /// True when this measurement became the pair's target.
    pub new_baseline: bool,
}

/// One measured pair, ready for the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub pair: PairIndex,
    pub name: String,
    /// `None` when uncalibrated.
    pub measured_cm: Option<f64>,
    pub pixel_distance: f64,
    pub target_cm: Option<f64>,
    /// `(target - tolerance, target + tolerance)` when a target exists.
    pub tolerance_bounds: Option<(f64, f64)>,
    pub passed: bool,
    pub is_fallback: bool,
}

pub struct MeasurementEngine {
    tolerance_cm: f64,
}

impl MeasurementEngine {
    pub fn new(tolerance_cm: f64) -> Self {
        Self { tolerance_cm }
    }

    pub fn tolerance_cm(&self) -> f64 {
        self.tolerance_cm
    }

    /// Convert pixels to centimeters. `None` unless calibrated.
    pub fn to_real_distance(&self, calibration: &Calibration, pixel_distance: f64) -> Option<f64> {
        calibration.to_cm(pixel_distance)
    }

    /// Check `measured_cm` against the pair's target.
    ///
    /// Without a target, the measurement becomes the target and passes.
    pub fn check_qc(&self, targets: &mut BTreeMap<PairIndex, f64>, pair: PairIndex, measured_cm: f64) -> QcVerdict {
        match targets.get(&pair) {
            Some(&target_cm) => QcVerdict {
                passed: (measured_cm - target_cm).abs() <= self.tolerance_cm,
                target_cm,
                new_baseline: false,
            },
            None => {
                targets.insert(pair, measured_cm);
                info!("{}: no target, baseline set to {:.2} cm", pair, measured_cm);
                QcVerdict {
                    passed: true,
                    target_cm: measured_cm,
                    new_baseline: true,
                }
            }
        }
    }

    /// Measure every pair of `reference` from this frame's tracked keypoints.
    ///
    /// Keypoints with no resolved position fall back to their annotation
    /// coordinate scaled to the live frame size. Returns the records and
    /// whether any new baseline was written into `reference`.
    pub fn measure(
        &self,
        reference: &mut ReferenceSide,
        calibration: &Calibration,
        tracked: &[TrackedKeypoint],
        live_size: (i32, i32),
    ) -> (Vec<MeasurementRecord>, bool) {
        let (points, fallback) = resolve_positions(reference, tracked, live_size);
        let mut new_baseline = false;

        let records = pairs(points.len())
            .iter()
            .filter_map(|pair| {
                let pixel_distance = pair_distance(&points, pair)?;
                let is_fallback = fallback[pair.first] || fallback[pair.second];
                let name = reference.pair_name(pair.index);

                let Some(measured_cm) = self.to_real_distance(calibration, pixel_distance) else {
                    let target_cm = reference.target(pair.index);
                    return Some(MeasurementRecord {
                        pair: pair.index,
                        name,
                        measured_cm: None,
                        pixel_distance,
                        target_cm,
                        tolerance_bounds: target_cm.map(|t| self.bounds(t)),
                        passed: false,
                        is_fallback,
                    });
                };

                let verdict = self.check_qc(&mut reference.target_distances, pair.index, measured_cm);
                new_baseline |= verdict.new_baseline;
                Some(MeasurementRecord {
                    pair: pair.index,
                    name,
                    measured_cm: Some(measured_cm),
                    pixel_distance,
                    target_cm: Some(verdict.target_cm),
                    tolerance_bounds: Some(self.bounds(verdict.target_cm)),
                    passed: verdict.passed,
                    is_fallback,
                })
            })
            .collect();

        (records, new_baseline)
    }

    fn bounds(&self, target_cm: f64) -> (f64, f64) {
        (target_cm - self.tolerance_cm, target_cm + self.tolerance_cm)
    }
}

/// Final per-keypoint positions plus fallback flags.
///
/// Tracking may be shorter than the annotation (e.g. right after a reference
/// change); missing entries are treated as unresolved.
pub fn resolve_positions(
    reference: &ReferenceSide,
    tracked: &[TrackedKeypoint],
    live_size: (i32, i32),
) -> (Vec<Point2<f64>>, Vec<bool>) {
    let sx = live_size.0 as f64 / reference.width().max(1) as f64;
    let sy = live_size.1 as f64 / reference.height().max(1) as f64;

    reference
        .keypoints
        .iter()
        .enumerate()
        .map(|(i, kp)| match tracked.get(i) {
            Some(TrackedKeypoint {
                position: Some(p),
                is_fallback,
            }) => (*p, *is_fallback),
            _ => (Point2::new(kp.position.x * sx, kp.position.y * sy), true),
        })
        .unzip()
}
