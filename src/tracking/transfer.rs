//! Geometric transfer of reference keypoints into the live frame.
//!
//! Two models are estimated from feature matches:
//! - a RANSAC homography (rigid planar motion), rejected when |det(H)| leaves
//!   the configured interval;
//! - moving least squares (MLS) inverse-distance interpolation of match
//!   displacements, used for non-rigid deformation and as the fallback.

use nalgebra::{Matrix3, Point2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Vector};
use opencv::prelude::*;

use crate::config::TransferConfig;
use crate::error::{FailureKind, Result};
use crate::tracking::candidate::Candidate;
use crate::tracking::features::FeatureMatch;

/// Weight assigned to a match that coincides with the keypoint.
const COINCIDENT_WEIGHT: f64 = 1e6;
const COINCIDENT_DISTANCE: f64 = 1e-6;

/// Which model produced the feature-based candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Homography,
    Mls,
    /// Homography was attempted but rejected; MLS was used instead.
    MlsFallback,
    /// Too few matches for any model.
    None,
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferMethod::Homography => "homography",
            TransferMethod::Mls => "mls",
            TransferMethod::MlsFallback => "mls (homography fallback)",
            TransferMethod::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Robust homography reference -> current. `None` if OpenCV finds no model.
pub fn fit_homography(matches: &[FeatureMatch], reproj_threshold: f64) -> Result<Option<Matrix3<f64>>> {
    let src: Vector<Point2f> = matches
        .iter()
        .map(|m| Point2f::new(m.reference.x as f32, m.reference.y as f32))
        .collect();
    let dst: Vector<Point2f> = matches
        .iter()
        .map(|m| Point2f::new(m.current.x as f32, m.current.y as f32))
        .collect();

    let mut mask = Mat::default();
    let h = calib3d::find_homography(&src, &dst, &mut mask, calib3d::RANSAC, reproj_threshold)?;
    if h.empty() || h.rows() != 3 || h.cols() != 3 {
        return Ok(None);
    }

    let mut out = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            out[(r, c)] = *h.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(Some(out))
}

/// Accept `h` only if |det(h)| lies strictly inside (det_min, det_max).
pub fn validate_homography(
    h: &Matrix3<f64>,
    det_min: f64,
    det_max: f64,
) -> std::result::Result<Matrix3<f64>, FailureKind> {
    let det = h.determinant().abs();
    if det.is_finite() && det > det_min && det < det_max {
        Ok(*h)
    } else {
        Err(FailureKind::HomographyDegenerate)
    }
}

/// Project `p` through `h`. `None` when the point maps to infinity.
pub fn project(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < f64::EPSILON {
        return None;
    }
    let q = Point2::new(v.x / v.z, v.y / v.z);
    (q.x.is_finite() && q.y.is_finite()).then_some(q)
}

/// Homography transfer of every keypoint.
///
/// Requires `config.min_matches` matches. A degenerate model is reported as
/// `HomographyDegenerate` and nothing is projected.
pub fn transfer_with_homography(
    matches: &[FeatureMatch],
    keypoints: &[Point2<f64>],
    config: &TransferConfig,
) -> std::result::Result<Vec<Candidate>, FailureKind> {
    if matches.len() < config.min_matches.max(4) {
        return Err(FailureKind::InsufficientMatches);
    }
    let h = match fit_homography(matches, config.ransac_reproj_threshold) {
        Ok(Some(h)) => h,
        Ok(None) => return Err(FailureKind::HomographyDegenerate),
        Err(_) => return Err(FailureKind::VisionError),
    };
    let h = validate_homography(&h, config.det_min, config.det_max)?;
    Ok(project_all(&h, keypoints))
}

/// Project all keypoints through an accepted homography.
pub fn project_all(h: &Matrix3<f64>, keypoints: &[Point2<f64>]) -> Vec<Candidate> {
    keypoints
        .iter()
        .map(|p| match project(h, p) {
            Some(q) => Candidate::Located(q),
            None => Candidate::Missing(FailureKind::HomographyDegenerate),
        })
        .collect()
}

/// Inverse-distance weighted interpolation of match destinations.
///
/// For each keypoint: weight_i = 1 / d_i^(2·alpha), with d_i the distance from
/// the keypoint to match i's reference location (coincident matches get a
/// large fixed weight). The result is the weighted centroid of the match
/// destinations.
pub fn transfer_with_mls(matches: &[FeatureMatch], keypoints: &[Point2<f64>], alpha: f64) -> Vec<Candidate> {
    keypoints
        .iter()
        .map(|kp| {
            let mut total = 0.0;
            let mut wx = 0.0;
            let mut wy = 0.0;
            for m in matches {
                let d = (kp - m.reference).norm();
                let w = if d < COINCIDENT_DISTANCE {
                    COINCIDENT_WEIGHT
                } else {
                    1.0 / d.powf(2.0 * alpha)
                };
                total += w;
                wx += w * m.current.x;
                wy += w * m.current.y;
            }
            if total > 0.0 && total.is_finite() {
                Candidate::at(wx / total, wy / total)
            } else {
                Candidate::Missing(FailureKind::InsufficientMatches)
            }
        })
        .collect()
}

/// Median pairwise distance ratio (current / reference), smoothed against `previous`.
///
/// Pairs whose reference separation is at most `scale_min_pair_distance` are
/// ignored. With fewer than `mls_min_matches` matches, or no usable pairs,
/// `previous` is returned unchanged.
pub fn estimate_scale_change(matches: &[FeatureMatch], previous: f64, config: &TransferConfig) -> f64 {
    if matches.len() < config.mls_min_matches {
        return previous;
    }

    let mut ratios = Vec::new();
    for i in 0..matches.len() {
        for j in (i + 1)..matches.len() {
            let ref_d = (matches[i].reference - matches[j].reference).norm();
            if ref_d <= config.scale_min_pair_distance {
                continue;
            }
            let cur_d = (matches[i].current - matches[j].current).norm();
            ratios.push(cur_d / ref_d);
        }
    }
    let Some(median) = median(&mut ratios) else {
        return previous;
    };

    let k = config.scale_smoothing;
    previous * (1.0 - k) + median * k
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    })
}

/// Select and run the transfer model for the current match count.
///
/// - `>= homography_min_matches`: homography, MLS if it is rejected
/// - `>= mls_min_matches`: MLS
/// - otherwise every keypoint is `Missing(InsufficientMatches)`
pub fn transfer_features(
    matches: &[FeatureMatch],
    keypoints: &[Point2<f64>],
    config: &TransferConfig,
) -> (TransferMethod, Vec<Candidate>) {
    if matches.len() >= config.homography_min_matches {
        match transfer_with_homography(matches, keypoints, config) {
            Ok(candidates) => return (TransferMethod::Homography, candidates),
            Err(kind) => {
                tracing::debug!("Homography rejected ({}), using MLS", kind);
                return (
                    TransferMethod::MlsFallback,
                    transfer_with_mls(matches, keypoints, config.mls_alpha),
                );
            }
        }
    }
    if matches.len() >= config.mls_min_matches {
        return (
            TransferMethod::Mls,
            transfer_with_mls(matches, keypoints, config.mls_alpha),
        );
    }
    (
        TransferMethod::None,
        vec![Candidate::Missing(FailureKind::InsufficientMatches); keypoints.len()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_matches(f: impl Fn(Point2<f64>) -> Point2<f64>) -> Vec<FeatureMatch> {
        let mut matches = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                let p = Point2::new(40.0 + 90.0 * i as f64, 30.0 + 80.0 * j as f64);
                matches.push(FeatureMatch::new(p, f(p)));
            }
        }
        matches
    }

    #[test]
    fn degenerate_determinants_are_rejected() {
        let config = TransferConfig::default();
        let shrink = Matrix3::new(0.2, 0.0, 0.0, 0.0, 0.2, 0.0, 0.0, 0.0, 1.0);
        let blow_up = Matrix3::new(4.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 1.0);
        let flat = Matrix3::new(1.0, 2.0, 0.0, 2.0, 4.0, 0.0, 0.0, 0.0, 1.0);
        for h in [shrink, blow_up, flat] {
            assert_eq!(
                validate_homography(&h, config.det_min, config.det_max),
                Err(FailureKind::HomographyDegenerate)
            );
        }
        let mild = Matrix3::new(1.5, 0.0, 3.0, 0.0, 1.5, -2.0, 0.0, 0.0, 1.0);
        assert!(validate_homography(&mild, config.det_min, config.det_max).is_ok());
    }

    #[test]
    fn homography_recovers_similarity() {
        let config = TransferConfig::default();
        let matches = grid_matches(|p| Point2::new(1.2 * p.x + 15.0, 1.2 * p.y - 8.0));
        let keypoints = vec![Point2::new(100.0, 100.0), Point2::new(250.0, 320.0)];

        let candidates = transfer_with_homography(&matches, &keypoints, &config).unwrap();
        let p = candidates[1].position().unwrap();
        assert_relative_eq!(p.x, 1.2 * 250.0 + 15.0, epsilon = 0.5);
        assert_relative_eq!(p.y, 1.2 * 320.0 - 8.0, epsilon = 0.5);
    }

    #[test]
    fn homography_needs_min_matches() {
        let config = TransferConfig::default();
        let matches = grid_matches(|p| p)[..10].to_vec();
        assert_eq!(
            transfer_with_homography(&matches, &[Point2::origin()], &config).unwrap_err(),
            FailureKind::InsufficientMatches
        );
    }

    #[test]
    fn collapsing_motion_falls_back_to_mls() {
        let config = TransferConfig::default();
        // Uniform 0.25x shrink: |det| = 0.0625, outside (0.1, 10).
        let matches = grid_matches(|p| Point2::new(0.25 * p.x, 0.25 * p.y));
        let (method, candidates) = transfer_features(&matches, &[Point2::new(220.0, 190.0)], &config);
        assert_eq!(method, TransferMethod::MlsFallback);
        assert!(candidates[0].is_located());
    }

    #[test]
    fn mls_single_coincident_match_returns_its_destination() {
        let kp = Point2::new(12.0, 34.0);
        let matches = vec![FeatureMatch::new(kp, Point2::new(56.0, 78.0))];
        let out = transfer_with_mls(&matches, &[kp], 1.0);
        assert_eq!(out[0].position(), Some(Point2::new(56.0, 78.0)));
    }

    #[test]
    fn mls_is_dominated_by_nearest_match() {
        let matches = vec![
            FeatureMatch::new(Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)),
            FeatureMatch::new(Point2::new(100.0, 0.0), Point2::new(130.0, 0.0)),
        ];
        let out = transfer_with_mls(&matches, &[Point2::new(10.0, 0.0)], 1.0);
        let p = out[0].position().unwrap();
        // weights 1/100 and 1/8100
        let expected = (10.0 / 100.0 + 130.0 / 8100.0) / (1.0 / 100.0 + 1.0 / 8100.0);
        assert_relative_eq!(p.x, expected, epsilon = 1e-9);
        assert_relative_eq!(p.y, 0.0);
    }

    #[test]
    fn mls_without_matches_is_missing() {
        let out = transfer_with_mls(&[], &[Point2::new(1.0, 1.0)], 1.0);
        assert_eq!(out[0], Candidate::Missing(FailureKind::InsufficientMatches));
    }

    #[test]
    fn selection_policy_by_match_count() {
        let config = TransferConfig::default();
        let all = grid_matches(|p| Point2::new(p.x + 5.0, p.y + 5.0));
        let kps = [Point2::new(200.0, 200.0)];

        assert_eq!(transfer_features(&all, &kps, &config).0, TransferMethod::Homography);
        assert_eq!(transfer_features(&all[..12], &kps, &config).0, TransferMethod::Mls);
        let (method, candidates) = transfer_features(&all[..3], &kps, &config);
        assert_eq!(method, TransferMethod::None);
        assert!(!candidates[0].is_located());
    }

    #[test]
    fn scale_estimate_is_smoothed_median() {
        let config = TransferConfig::default();
        let matches = grid_matches(|p| Point2::new(2.0 * p.x, 2.0 * p.y));
        let s = estimate_scale_change(&matches, 1.0, &config);
        assert_relative_eq!(s, 0.7 * 1.0 + 0.3 * 2.0, epsilon = 1e-9);

        // Too few matches keeps the previous estimate.
        assert_relative_eq!(estimate_scale_change(&matches[..3], 1.4, &config), 1.4);
    }

    #[test]
    fn scale_ignores_close_pairs() {
        let config = TransferConfig::default();
        let matches = vec![
            FeatureMatch::new(Point2::new(0.0, 0.0), Point2::new(0.0, 0.0)),
            FeatureMatch::new(Point2::new(5.0, 0.0), Point2::new(50.0, 0.0)),
            FeatureMatch::new(Point2::new(0.0, 3.0), Point2::new(0.0, 90.0)),
            FeatureMatch::new(Point2::new(2.0, 2.0), Point2::new(70.0, 70.0)),
        ];
        // Every reference pair is within 10px: no usable ratio.
        assert_relative_eq!(estimate_scale_change(&matches, 1.1, &config), 1.1);
    }

    #[test]
    fn projection_at_infinity_is_missing() {
        let h = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
        assert!(project(&h, &Point2::new(0.0, 5.0)).is_none());
        let out = project_all(&h, &[Point2::new(0.0, 5.0), Point2::new(2.0, 4.0)]);
        assert!(!out[0].is_located());
        assert_eq!(out[1].position(), Some(Point2::new(1.0, 2.0)));
    }
}
