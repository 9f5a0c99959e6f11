//! Merge per-keypoint estimates from the feature, template and corner paths.

use nalgebra::Point2;

use crate::config::FusionConfig;
use crate::reference::KeypointRole;
use crate::tracking::candidate::Candidate;

pub struct FusionResolver {
    config: FusionConfig,
}

impl FusionResolver {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Corner keypoints: corner > feature > template.
    pub fn resolve_corner(&self, corner: Candidate, feature: Candidate, template: Candidate) -> Candidate {
        [corner, feature, template]
            .into_iter()
            .find(Candidate::is_located)
            .unwrap_or(corner)
    }

    /// Regular keypoints: blend when feature and template agree, otherwise
    /// trust features only when the match set is healthy.
    pub fn resolve_regular(&self, feature: Candidate, template: Candidate, healthy_matches: bool) -> Candidate {
        match (feature.position(), template.position()) {
            (Some(f), Some(t)) => {
                if (f - t).norm() < self.config.agreement_distance {
                    let wf = if healthy_matches {
                        self.config.feature_weight_healthy
                    } else {
                        self.config.feature_weight_weak
                    };
                    let wt = 1.0 - wf;
                    Candidate::Located(Point2::new(wf * f.x + wt * t.x, wf * f.y + wt * t.y))
                } else if healthy_matches {
                    feature
                } else {
                    template
                }
            }
            (Some(_), None) => feature,
            (None, Some(_)) => template,
            (None, None) => feature,
        }
    }

    /// Fuse whole keypoint lists.
    ///
    /// `corners` covers the leading corner keypoints only; it may be shorter
    /// than the others.
    pub fn fuse(
        &self,
        roles: &[KeypointRole],
        features: &[Candidate],
        templates: &[Candidate],
        corners: &[Candidate],
        healthy_matches: bool,
    ) -> Vec<Candidate> {
        roles
            .iter()
            .enumerate()
            .map(|(i, role)| {
                let feature = features[i];
                let template = templates[i];
                match (role, corners.get(i)) {
                    (KeypointRole::Corner, Some(corner)) => self.resolve_corner(*corner, feature, template),
                    _ => self.resolve_regular(feature, template, healthy_matches),
                }
            })
            .collect()
    }
}
