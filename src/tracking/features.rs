//! ORB extraction and ratio-tested matching between reference and live frames.

use nalgebra::Point2;
use opencv::core::{DMatch, KeyPoint, Mat, Ptr, Size, Vector};
use opencv::features2d::{self, BFMatcher};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::FeatureConfig;
use crate::error::Result;

/// Sparse features of one image, in original-resolution pixel coordinates.
#[derive(Clone)]
pub struct FeatureSet {
    pub points: Vec<Point2<f64>>,
    pub descriptors: Mat,
}

impl FeatureSet {
    pub fn empty() -> Self {
        Self {
            points: Vec::new(),
            descriptors: Mat::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() || self.descriptors.empty()
    }
}

/// A ratio-test survivor: where a reference feature was found in the live frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub reference: Point2<f64>,
    pub current: Point2<f64>,
}

impl FeatureMatch {
    pub fn new(reference: Point2<f64>, current: Point2<f64>) -> Self {
        Self { reference, current }
    }
}

pub struct FeatureTracker {
    orb: Ptr<features2d::ORB>,
    matcher: BFMatcher,
    config: FeatureConfig,
}

impl FeatureTracker {
    pub fn new(config: FeatureConfig) -> Result<Self> {
        let orb = features2d::ORB::create(
            config.n_features,
            1.2,
            8,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        let matcher = BFMatcher::new(opencv::core::NORM_HAMMING, false)?;
        Ok(Self {
            orb,
            matcher,
            config,
        })
    }

    /// Detect ORB features. Never fails: errors yield an empty set.
    pub fn extract_features(&mut self, image: &Mat) -> FeatureSet {
        match self.try_extract(image) {
            Ok(features) => features,
            Err(e) => {
                tracing::debug!("ORB extraction failed: {}", e);
                FeatureSet::empty()
            }
        }
    }

    fn try_extract(&mut self, image: &Mat) -> Result<FeatureSet> {
        if image.empty() {
            return Ok(FeatureSet::empty());
        }

        let (w, h) = (image.cols(), image.rows());
        let scale = downscale_factor(w, h, self.config.max_dimension);
        let resized = if scale < 1.0 {
            let new_w = ((w as f64) * scale) as i32;
            let new_h = ((h as f64) * scale) as i32;
            let mut dst = Mat::default();
            imgproc::resize(
                image,
                &mut dst,
                Size::new(new_w, new_h),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            dst
        } else {
            image.try_clone()?
        };

        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(&resized, &mask, &mut keypoints, &mut descriptors, false)?;

        // Map back to the original resolution.
        let back = if scale < 1.0 {
            w as f64 / resized.cols() as f64
        } else {
            1.0
        };
        let points = keypoints
            .iter()
            .map(|kp| Point2::new(kp.pt().x as f64 * back, kp.pt().y as f64 * back))
            .collect();

        Ok(FeatureSet {
            points,
            descriptors,
        })
    }

    /// 2-NN Hamming search with Lowe's ratio test.
    pub fn match_features(&self, reference: &FeatureSet, current: &FeatureSet) -> Vec<FeatureMatch> {
        if reference.is_empty() || current.is_empty() {
            return Vec::new();
        }
        match self.try_match(reference, current) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::debug!("Descriptor matching failed: {}", e);
                Vec::new()
            }
        }
    }

    fn try_match(&self, reference: &FeatureSet, current: &FeatureSet) -> Result<Vec<FeatureMatch>> {
        let mut knn = Vector::<Vector<DMatch>>::new();
        self.matcher.knn_train_match(
            &reference.descriptors,
            &current.descriptors,
            &mut knn,
            2,
            &Mat::default(),
            false,
        )?;

        let mut matches = Vec::new();
        for pair in knn.iter() {
            if pair.len() < 2 {
                continue;
            }
            let best = pair.get(0)?;
            let second = pair.get(1)?;
            if !passes_ratio_test(best.distance, second.distance, self.config.ratio) {
                continue;
            }
            let (Some(r), Some(c)) = (
                reference.points.get(best.query_idx as usize),
                current.points.get(best.train_idx as usize),
            ) else {
                continue;
            };
            matches.push(FeatureMatch::new(*r, *c));
        }
        Ok(matches)
    }
}

/// Factor (≤ 1) that brings the longer side down to `max_dimension`.
pub fn downscale_factor(width: i32, height: i32, max_dimension: i32) -> f64 {
    let longest = width.max(height);
    if longest > max_dimension && max_dimension > 0 {
        max_dimension as f64 / longest as f64
    } else {
        1.0
    }
}

/// Lowe's ratio test.
pub fn passes_ratio_test(best: f32, second: f32, ratio: f32) -> bool {
    best <= ratio * second
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::test_support::{blocky_texture, crop};
    use approx::assert_relative_eq;

    #[test]
    fn downscale_only_when_oversized() {
        assert_relative_eq!(downscale_factor(1600, 1200, 800), 0.5);
        assert_relative_eq!(downscale_factor(640, 800, 800), 1.0);
        assert_relative_eq!(downscale_factor(400, 1000, 800), 0.8);
    }

    #[test]
    fn ratio_test_boundary() {
        assert!(passes_ratio_test(30.0, 40.0, 0.75));
        assert!(passes_ratio_test(29.0, 40.0, 0.75));
        assert!(!passes_ratio_test(31.0, 40.0, 0.75));
    }

    #[test]
    fn empty_image_yields_empty_features() {
        let mut tracker = FeatureTracker::new(FeatureConfig::default()).unwrap();
        let features = tracker.extract_features(&Mat::default());
        assert!(features.is_empty());
        assert!(tracker.match_features(&features, &features).is_empty());
    }

    #[test]
    fn large_images_report_full_resolution_coordinates() {
        let image = blocky_texture(1600, 1000, 7);
        let mut tracker = FeatureTracker::new(FeatureConfig::default()).unwrap();
        let features = tracker.extract_features(&image);
        assert!(!features.is_empty());
        assert!(features.points.iter().any(|p| p.x > 800.0));
        assert!(features.points.iter().all(|p| p.x < 1600.0 && p.y < 1000.0));
    }

    #[test]
    fn shifted_view_matches_with_consistent_offset() {
        let texture = blocky_texture(700, 520, 11);
        let reference = crop(&texture, 0, 0, 640, 480);
        let current = crop(&texture, 20, 10, 640, 480);

        let mut tracker = FeatureTracker::new(FeatureConfig::default()).unwrap();
        let ref_features = tracker.extract_features(&reference);
        let cur_features = tracker.extract_features(&current);
        let matches = tracker.match_features(&ref_features, &cur_features);
        assert!(matches.len() >= 20, "got {} matches", matches.len());

        let mut dx: Vec<f64> = matches.iter().map(|m| m.current.x - m.reference.x).collect();
        let mut dy: Vec<f64> = matches.iter().map(|m| m.current.y - m.reference.y).collect();
        dx.sort_by(|a, b| a.partial_cmp(b).unwrap());
        dy.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((dx[dx.len() / 2] + 20.0).abs() < 1.5);
        assert!((dy[dy.len() / 2] + 10.0).abs() < 1.5);
    }
}
