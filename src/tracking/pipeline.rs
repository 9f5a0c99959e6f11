//! Per-frame keypoint re-localization.
//!
//! `KeypointTracker::process_frame` is the single entry point used by the
//! measurement loop:
//!
//! 1. Same dimensions as the reference: direct placement + local refinement.
//! 2. Otherwise: ORB matching -> homography/MLS transfer, template search,
//!    corner detection, then fusion.
//! 3. Either way the result goes through stabilization.

use std::time::Instant;

use opencv::core::Mat;
use opencv::prelude::*;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{FailureKind, Result};
use crate::reference::{KeypointRole, ReferenceSide, Side};
use crate::tracking::candidate::{count_located, Candidate};
use crate::tracking::corners::CornerDetector;
use crate::tracking::direct::DirectPlacementRefiner;
use crate::tracking::features::{FeatureSet, FeatureTracker};
use crate::tracking::fusion::FusionResolver;
use crate::tracking::result::{PlacementMode, TimingStats, TrackedKeypoint, TransferMetrics, TransferResult};
use crate::tracking::stabilization::{StabilizationFilter, TrackingState};
use crate::tracking::template::TemplateMatcher;
use crate::tracking::transfer::{estimate_scale_change, transfer_features, TransferMethod};

pub struct KeypointTracker {
    config: EngineConfig,
    features: FeatureTracker,
    templates: TemplateMatcher,
    corners: CornerDetector,
    direct: DirectPlacementRefiner,
    fusion: FusionResolver,
    stabilizer: StabilizationFilter,
    /// Reference ORB features, extracted once per side.
    reference_cache: Option<(Side, FeatureSet)>,
    last_mode: Option<PlacementMode>,
}

impl KeypointTracker {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            features: FeatureTracker::new(config.features.clone())?,
            templates: TemplateMatcher::new(config.template.clone(), config.corners.clone()),
            corners: CornerDetector::new(config.corners.clone()),
            direct: DirectPlacementRefiner::new(config.direct.clone()),
            fusion: FusionResolver::new(config.fusion.clone()),
            stabilizer: StabilizationFilter::new(config.stabilization.clone()),
            reference_cache: None,
            last_mode: None,
            config,
        })
    }

    /// Drop cached reference features (side switch or new reference).
    pub fn invalidate_reference(&mut self) {
        self.reference_cache = None;
        self.last_mode = None;
    }

    /// Re-localize every keypoint of `reference` in `live` (grayscale).
    pub fn process_frame(&mut self, reference: &ReferenceSide, live: &Mat, state: &mut TrackingState) -> TransferResult {
        let t_start = Instant::now();

        let mode = if DirectPlacementRefiner::applies(&reference.gray, live) {
            PlacementMode::Direct
        } else {
            PlacementMode::Scaling
        };
        if self.last_mode != Some(mode) {
            info!(
                "{} side: {} mode (reference {}x{}, live {}x{})",
                reference.side,
                mode,
                reference.width(),
                reference.height(),
                live.cols(),
                live.rows()
            );
            self.last_mode = Some(mode);
        }

        let mut result = match mode {
            PlacementMode::Direct => self.process_direct(reference, live, state),
            PlacementMode::Scaling => self.process_scaling(reference, live, state),
        };
        result.timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            "Transfer [{}]: {} matches via {}, feature {}/{n}, template {}/{n}, corner {}, refined {}, tracked {}/{n}, scale {:.3}, {:.1} ms",
            result.mode,
            result.metrics.n_matches,
            result.metrics.method,
            result.metrics.valid_feature,
            result.metrics.valid_template,
            result.metrics.valid_corner,
            result.metrics.refined_direct,
            result.tracked_count(),
            result.metrics.scale,
            result.timing.total_ms,
            n = result.keypoints.len(),
        );
        result
    }

    fn process_direct(&mut self, reference: &ReferenceSide, live: &Mat, state: &mut TrackingState) -> TransferResult {
        let t_template = Instant::now();
        let placements = self.direct.refine(&reference.gray, live, &reference.positions());
        let mut timing = TimingStats::zero();
        timing.template_ms = t_template.elapsed().as_secs_f64() * 1000.0;

        let candidates: Vec<Candidate> = placements.iter().map(|p| Candidate::Located(p.position())).collect();
        let stabilized = self.stabilizer.apply(state, &candidates);

        let keypoints = placements
            .iter()
            .zip(&stabilized)
            .map(|(placement, s)| TrackedKeypoint {
                position: s.position,
                is_fallback: !placement.is_refined() || !s.is_tracked(),
            })
            .collect();

        let mut metrics = TransferMetrics::zero();
        metrics.refined_direct = placements.iter().filter(|p| p.is_refined()).count();
        metrics.scale = state.last_detected_scale;

        TransferResult {
            mode: PlacementMode::Direct,
            keypoints,
            is_stabilized: state.is_stabilized,
            metrics,
            timing,
            failures: Vec::new(),
        }
    }

    fn process_scaling(&mut self, reference: &ReferenceSide, live: &Mat, state: &mut TrackingState) -> TransferResult {
        let mut timing = TimingStats::zero();
        let mut failures = Vec::new();
        let positions = reference.positions();
        let roles: Vec<KeypointRole> = reference.keypoints.iter().map(|k| k.role).collect();

        // Features
        let t_extract = Instant::now();
        let reference_features = self.reference_features(reference);
        let live_features = self.features.extract_features(live);
        timing.extract_ms = t_extract.elapsed().as_secs_f64() * 1000.0;
        if reference_features.is_empty() || live_features.is_empty() {
            failures.push(FailureKind::FeatureExtractionFailure);
        }

        let t_match = Instant::now();
        let matches = self.features.match_features(&reference_features, &live_features);
        let (method, feature_candidates) = transfer_features(&matches, &positions, &self.config.transfer);
        timing.match_ms = t_match.elapsed().as_secs_f64() * 1000.0;
        match method {
            TransferMethod::None => failures.push(FailureKind::InsufficientMatches),
            TransferMethod::MlsFallback => failures.push(FailureKind::HomographyDegenerate),
            TransferMethod::Homography | TransferMethod::Mls => {}
        }

        state.last_detected_scale = estimate_scale_change(&matches, state.last_detected_scale, &self.config.transfer);
        let scale = state.last_detected_scale;
        let healthy = matches.len() >= self.config.transfer.min_matches;

        // Template + corners
        let t_template = Instant::now();
        let template_candidates = self.templates.match_keypoints(&reference.gray, &positions, live, scale);
        timing.template_ms = t_template.elapsed().as_secs_f64() * 1000.0;

        let t_corner = Instant::now();
        let corner_candidates = self
            .corners
            .detect(&self.templates, &reference.gray, &positions, live, scale);
        timing.corner_ms = t_corner.elapsed().as_secs_f64() * 1000.0;

        let fused = self.fusion.fuse(
            &roles,
            &feature_candidates,
            &template_candidates,
            &corner_candidates,
            healthy,
        );
        let stabilized = self.stabilizer.apply(state, &fused);

        let keypoints = stabilized
            .iter()
            .map(|s| TrackedKeypoint {
                position: s.position,
                is_fallback: !s.is_tracked(),
            })
            .collect();

        let metrics = TransferMetrics {
            n_reference_features: reference_features.len(),
            n_live_features: live_features.len(),
            n_matches: matches.len(),
            method,
            valid_feature: count_located(&feature_candidates),
            valid_template: count_located(&template_candidates),
            valid_corner: count_located(&corner_candidates),
            refined_direct: 0,
            scale,
        };

        TransferResult {
            mode: PlacementMode::Scaling,
            keypoints,
            is_stabilized: state.is_stabilized,
            metrics,
            timing,
            failures,
        }
    }

    fn reference_features(&mut self, reference: &ReferenceSide) -> FeatureSet {
        if let Some((side, cached)) = &self.reference_cache {
            if *side == reference.side {
                return cached.clone();
            }
        }
        let extracted = self.features.extract_features(&reference.gray);
        debug!("{} reference: {} ORB features", reference.side, extracted.len());
        self.reference_cache = Some((reference.side, extracted.clone()));
        extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::AnnotationRecord;
    use crate::tracking::test_support::{blocky_texture, crop, flat};
    use opencv::core::Size;
    use opencv::imgproc;

    fn reference_from(gray: Mat, points: &[[f64; 2]], corner_count: usize) -> ReferenceSide {
        ReferenceSide::from_record(Side::Front, gray, AnnotationRecord::new(points.to_vec()), corner_count).unwrap()
    }

    #[test]
    fn direct_mode_for_matching_dimensions() {
        let texture = blocky_texture(680, 500, 21);
        let reference = reference_from(
            crop(&texture, 20, 20, 640, 460),
            &[[200.0, 200.0], [420.0, 240.0], [300.0, 330.0], [500.0, 120.0]],
            2,
        );
        let live = crop(&texture, 17, 24, 640, 460);

        let mut tracker = KeypointTracker::new(EngineConfig::default()).unwrap();
        let mut state = TrackingState::new();
        let result = tracker.process_frame(&reference, &live, &mut state);

        assert_eq!(result.mode, PlacementMode::Direct);
        assert_eq!(result.metrics.refined_direct, 4);
        let p = result.keypoints[0].position.unwrap();
        assert_eq!((p.x, p.y), (203.0, 196.0));
        assert!(result.keypoints.iter().all(|k| !k.is_fallback));
    }

    #[test]
    fn direct_mode_on_blank_frame_keeps_annotation_as_fallback() {
        let reference = reference_from(blocky_texture(320, 240, 22), &[[100.0, 100.0], [200.0, 150.0]], 2);
        let live = flat(320, 240, 0.0);

        let mut tracker = KeypointTracker::new(EngineConfig::default()).unwrap();
        let mut state = TrackingState::new();
        let result = tracker.process_frame(&reference, &live, &mut state);

        assert_eq!(result.keypoints[1].position.map(|p| (p.x, p.y)), Some((200.0, 150.0)));
        assert!(result.keypoints.iter().all(|k| k.is_fallback));
    }

    #[test]
    fn scaling_mode_tracks_resized_view() {
        let reference_gray = blocky_texture(960, 720, 23);
        let mut live = Mat::default();
        imgproc::resize(&reference_gray, &mut live, Size::new(720, 540), 0.0, 0.0, imgproc::INTER_AREA).unwrap();
        let points = [[300.0, 300.0], [600.0, 420.0], [480.0, 240.0], [720.0, 540.0]];
        // Regular keypoints only: the corner search does not rescale its patch.
        let reference = reference_from(reference_gray, &points, 0);

        let mut tracker = KeypointTracker::new(EngineConfig::default()).unwrap();
        let mut state = TrackingState::new();
        let result = tracker.process_frame(&reference, &live, &mut state);

        assert_eq!(result.mode, PlacementMode::Scaling);
        assert!(result.metrics.n_matches >= 20, "{} matches", result.metrics.n_matches);
        assert!(result.metrics.scale < 1.0);
        for (k, p) in result.keypoints.iter().zip(points) {
            let got = k.position.expect("keypoint resolved");
            assert!((got.x - 0.75 * p[0]).abs() < 8.0, "{:?} vs {:?}", got, p);
            assert!((got.y - 0.75 * p[1]).abs() < 8.0, "{:?} vs {:?}", got, p);
        }
    }

    #[test]
    fn scaling_mode_reports_failures_on_blank_frame() {
        let reference = reference_from(blocky_texture(640, 480, 24), &[[100.0, 100.0], [300.0, 200.0]], 2);
        let live = flat(320, 240, 0.0);

        let mut tracker = KeypointTracker::new(EngineConfig::default()).unwrap();
        let mut state = TrackingState::new();
        let result = tracker.process_frame(&reference, &live, &mut state);

        assert_eq!(result.metrics.method, TransferMethod::None);
        assert!(result.failures.contains(&FailureKind::FeatureExtractionFailure));
        assert!(result.failures.contains(&FailureKind::InsufficientMatches));
        assert!(result.keypoints.iter().all(|k| k.position.is_none() && k.is_fallback));
    }
}
