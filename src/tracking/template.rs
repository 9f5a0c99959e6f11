//! Local patch correlation search.
//!
//! A square patch is cut from the reference image around a keypoint and
//! searched for inside a window of the live frame. `search_patch` is the shared
//! primitive; `TemplateMatcher` applies it to all keypoints (general variant)
//! or to the corner keypoints (larger patch, two correlation methods).

use nalgebra::Point2;
use opencv::core::{self, Mat, Point, Rect};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::{CornerConfig, TemplateConfig};
use crate::error::{FailureKind, Result};
use crate::tracking::candidate::Candidate;

/// Best correlation peak found by a patch search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchMatch {
    /// Live-frame position of the patch center at the peak.
    pub position: Point2<f64>,
    pub score: f64,
}

/// Geometry of one patch search.
#[derive(Debug, Clone, Copy)]
pub struct PatchSearch<'a> {
    /// Patch center in the reference image.
    pub anchor: (i32, i32),
    /// Patch side before clipping.
    pub patch_size: i32,
    /// Minimum patch side after clipping.
    pub min_patch: i32,
    /// Search window center in the live frame.
    pub center: (i32, i32),
    /// Search window half-extent.
    pub search_half: i32,
    /// `imgproc::TM_*` methods to try; the highest peak wins.
    pub methods: &'a [i32],
}

/// Rectangle of half-extent `half` around `(cx, cy)`, clipped to `width x height`.
pub fn centered_window(cx: i32, cy: i32, half: i32, width: i32, height: i32) -> Rect {
    let x1 = (cx - half).max(0);
    let y1 = (cy - half).max(0);
    let x2 = (cx + half).min(width);
    let y2 = (cy + half).min(height);
    Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
}

/// Run a patch search. Geometry failures and OpenCV errors become `FailureKind`s.
pub fn search_patch(reference: &Mat, live: &Mat, search: &PatchSearch) -> std::result::Result<PatchMatch, FailureKind> {
    let patch_rect = centered_window(
        search.anchor.0,
        search.anchor.1,
        search.patch_size / 2,
        reference.cols(),
        reference.rows(),
    );
    if patch_rect.width < search.min_patch || patch_rect.height < search.min_patch {
        return Err(FailureKind::WindowOutOfBounds);
    }

    let window = centered_window(
        search.center.0,
        search.center.1,
        search.search_half,
        live.cols(),
        live.rows(),
    );
    if window.width < patch_rect.width || window.height < patch_rect.height {
        return Err(FailureKind::WindowOutOfBounds);
    }

    let (score, peak) =
        best_peak(reference, patch_rect, live, window, search.methods).map_err(|_| FailureKind::VisionError)?;

    Ok(PatchMatch {
        position: Point2::new(
            (window.x + peak.x + patch_rect.width / 2) as f64,
            (window.y + peak.y + patch_rect.height / 2) as f64,
        ),
        score,
    })
}

fn best_peak(reference: &Mat, patch_rect: Rect, live: &Mat, window: Rect, methods: &[i32]) -> Result<(f64, Point)> {
    let patch = Mat::roi(reference, patch_rect)?.try_clone()?;
    let region = Mat::roi(live, window)?.try_clone()?;

    let mut best = (f64::NEG_INFINITY, Point::new(0, 0));
    for &method in methods {
        let mut result = Mat::default();
        imgproc::match_template(&region, &patch, &mut result, method, &Mat::default())?;

        let mut max_val = 0.0;
        let mut max_loc = Point::default();
        core::min_max_loc(&result, None, Some(&mut max_val), None, Some(&mut max_loc), &Mat::default())?;
        if max_val > best.0 {
            best = (max_val, max_loc);
        }
    }
    Ok(best)
}

pub struct TemplateMatcher {
    general: TemplateConfig,
    corner: CornerConfig,
}

const GENERAL_METHODS: [i32; 1] = [imgproc::TM_CCOEFF_NORMED];
const CORNER_METHODS: [i32; 2] = [imgproc::TM_CCOEFF_NORMED, imgproc::TM_CCORR_NORMED];

impl TemplateMatcher {
    pub fn new(general: TemplateConfig, corner: CornerConfig) -> Self {
        Self { general, corner }
    }

    /// General template search for every keypoint.
    pub fn match_keypoints(&self, reference: &Mat, keypoints: &[Point2<f64>], live: &Mat, scale: f64) -> Vec<Candidate> {
        keypoints
            .iter()
            .map(|kp| {
                self.match_one(
                    reference,
                    kp,
                    live,
                    scale,
                    self.general.patch_size,
                    self.general.search_multiplier,
                    self.general.min_patch,
                    &GENERAL_METHODS,
                    self.general.threshold,
                )
            })
            .collect()
    }

    /// Corner-specialized search for the first `corner_count` keypoints.
    pub fn match_corners(&self, reference: &Mat, keypoints: &[Point2<f64>], live: &Mat, scale: f64) -> Vec<Candidate> {
        keypoints
            .iter()
            .take(self.corner.corner_count)
            .map(|kp| {
                self.match_one(
                    reference,
                    kp,
                    live,
                    scale,
                    self.corner.patch_size,
                    self.corner.search_multiplier,
                    self.corner.min_patch,
                    &CORNER_METHODS,
                    self.corner.template_threshold,
                )
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn match_one(
        &self,
        reference: &Mat,
        kp: &Point2<f64>,
        live: &Mat,
        scale: f64,
        patch_size: f64,
        search_multiplier: f64,
        min_patch: i32,
        methods: &[i32],
        threshold: f64,
    ) -> Candidate {
        // Patch and window both grow with the detected scale.
        let patch = (patch_size * scale) as i32;
        let search = PatchSearch {
            anchor: (kp.x as i32, kp.y as i32),
            patch_size: patch,
            min_patch,
            center: ((kp.x * scale) as i32, (kp.y * scale) as i32),
            search_half: (patch as f64 * search_multiplier * scale) as i32,
            methods,
        };
        match search_patch(reference, live, &search) {
            Ok(m) if m.score > threshold => Candidate::Located(m.position),
            Ok(_) => Candidate::Missing(FailureKind::TemplateBelowThreshold),
            Err(kind) => Candidate::Missing(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::test_support::{blocky_texture, crop, flat};

    fn matcher() -> TemplateMatcher {
        TemplateMatcher::new(TemplateConfig::default(), CornerConfig::default())
    }

    #[test]
    fn window_is_clipped_to_image() {
        let r = centered_window(5, 90, 20, 100, 100);
        assert_eq!((r.x, r.y, r.width, r.height), (0, 70, 25, 30));
        let empty = centered_window(-50, -50, 10, 100, 100);
        assert_eq!((empty.width, empty.height), (0, 0));
    }

    #[test]
    fn finds_shifted_patch() {
        let texture = blocky_texture(820, 620, 3);
        let reference = crop(&texture, 10, 10, 800, 600);
        let live = crop(&texture, 22, 4, 800, 600);
        let kps = [Point2::new(400.0, 300.0), Point2::new(250.0, 420.0)];

        let out = matcher().match_keypoints(&reference, &kps, &live, 1.0);
        for (kp, c) in kps.iter().zip(&out) {
            let p = c.position().expect("patch should be found");
            assert!((p.x - (kp.x - 12.0)).abs() <= 1.0, "{:?}", p);
            assert!((p.y - (kp.y + 6.0)).abs() <= 1.0, "{:?}", p);
        }
    }

    #[test]
    fn featureless_frame_is_below_threshold() {
        let reference = blocky_texture(400, 300, 5);
        let live = flat(400, 300, 0.0);
        let out = matcher().match_keypoints(&reference, &[Point2::new(200.0, 150.0)], &live, 1.0);
        assert_eq!(out[0], Candidate::Missing(FailureKind::TemplateBelowThreshold));
    }

    #[test]
    fn patch_outside_reference_is_out_of_bounds() {
        let reference = blocky_texture(400, 300, 5);
        let live = reference.try_clone().unwrap();
        let out = matcher().match_keypoints(&reference, &[Point2::new(-100.0, 150.0)], &live, 1.0);
        assert_eq!(out[0], Candidate::Missing(FailureKind::WindowOutOfBounds));
    }

    #[test]
    fn corner_variant_only_covers_corner_keypoints() {
        let texture = blocky_texture(900, 700, 9);
        let reference = crop(&texture, 0, 0, 880, 680);
        let live = crop(&texture, 5, 8, 880, 680);
        let kps: Vec<Point2<f64>> = (0..14)
            .map(|i| Point2::new(200.0 + 30.0 * i as f64, 340.0))
            .collect();

        let out = matcher().match_corners(&reference, &kps, &live, 1.0);
        assert_eq!(out.len(), 12);
        let p = out[0].position().unwrap();
        assert!((p.x - 195.0).abs() <= 1.0 && (p.y - 332.0).abs() <= 1.0, "{:?}", p);
    }
}
