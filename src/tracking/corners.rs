//! Corner refinement for boundary keypoints.
//!
//! For each corner keypoint three detectors are tried in order, first hit wins:
//! 1. corner template search (see `TemplateMatcher::match_corners`)
//! 2. strongest Shi-Tomasi corner in a window around the expected position
//! 3. Harris response peak above `harris_threshold`

use nalgebra::Point2;
use opencv::core::{self, Mat, Point, Point2f, Rect, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::CornerConfig;
use crate::error::{FailureKind, Result};
use crate::tracking::candidate::Candidate;
use crate::tracking::template::{centered_window, TemplateMatcher};

pub struct CornerDetector {
    config: CornerConfig,
}

impl CornerDetector {
    pub fn new(config: CornerConfig) -> Self {
        Self { config }
    }

    pub fn corner_count(&self) -> usize {
        self.config.corner_count
    }

    /// Candidates for the first `corner_count` keypoints (fewer if there are fewer keypoints).
    pub fn detect(
        &self,
        templates: &TemplateMatcher,
        reference: &Mat,
        keypoints: &[Point2<f64>],
        live: &Mat,
        scale: f64,
    ) -> Vec<Candidate> {
        let template_hits = templates.match_corners(reference, keypoints, live, scale);

        template_hits
            .into_iter()
            .zip(keypoints)
            .map(|(template, kp)| {
                if template.is_located() {
                    return template;
                }
                let Some(window) = self.detector_window(kp, live, scale) else {
                    return Candidate::Missing(FailureKind::WindowOutOfBounds);
                };
                let shi_tomasi = self.shi_tomasi(live, window);
                if shi_tomasi.is_located() {
                    return shi_tomasi;
                }
                let harris = self.harris(live, window);
                if harris.is_located() {
                    return harris;
                }
                template
            })
            .collect()
    }

    fn detector_window(&self, kp: &Point2<f64>, live: &Mat, scale: f64) -> Option<Rect> {
        let size = (self.config.window_size * scale) as i32;
        let window = centered_window(
            (kp.x * scale) as i32,
            (kp.y * scale) as i32,
            size / 2,
            live.cols(),
            live.rows(),
        );
        (window.width >= self.config.min_window && window.height >= self.config.min_window).then_some(window)
    }

    fn shi_tomasi(&self, live: &Mat, window: Rect) -> Candidate {
        match strongest_shi_tomasi(live, window, self.config.gftt_quality, self.config.gftt_min_distance) {
            Ok(Some(p)) => Candidate::Located(p),
            Ok(None) => Candidate::Missing(FailureKind::TemplateBelowThreshold),
            Err(_) => Candidate::Missing(FailureKind::VisionError),
        }
    }

    fn harris(&self, live: &Mat, window: Rect) -> Candidate {
        match harris_peak(live, window) {
            Ok((response, p)) if response > self.config.harris_threshold => Candidate::Located(p),
            Ok(_) => Candidate::Missing(FailureKind::TemplateBelowThreshold),
            Err(_) => Candidate::Missing(FailureKind::VisionError),
        }
    }
}

/// Best "good feature to track" inside `window`, in frame coordinates.
pub fn strongest_shi_tomasi(image: &Mat, window: Rect, quality: f64, min_distance: f64) -> Result<Option<Point2<f64>>> {
    let region = Mat::roi(image, window)?.try_clone()?;
    let mut corners = Vector::<Point2f>::new();
    imgproc::good_features_to_track_def(&region, &mut corners, 1, quality, min_distance)?;
    if corners.is_empty() {
        return Ok(None);
    }
    let c = corners.get(0)?;
    Ok(Some(Point2::new(
        window.x as f64 + c.x as f64,
        window.y as f64 + c.y as f64,
    )))
}

/// Peak Harris response inside `window` and its frame position.
pub fn harris_peak(image: &Mat, window: Rect) -> Result<(f64, Point2<f64>)> {
    let region = Mat::roi(image, window)?.try_clone()?;
    let mut response = Mat::default();
    imgproc::corner_harris_def(&region, &mut response, 2, 3, 0.04)?;

    let mut max_val = 0.0;
    let mut max_loc = Point::default();
    core::min_max_loc(&response, None, Some(&mut max_val), None, Some(&mut max_loc), &Mat::default())?;
    Ok((
        max_val,
        Point2::new((window.x + max_loc.x) as f64, (window.y + max_loc.y) as f64),
    ))
}
