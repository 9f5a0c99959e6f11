//! Temporal stabilization of fused keypoint positions.
//!
//! Small moves (below `jump_threshold`) are accepted directly. A larger jump
//! is accepted only if it is part of a coordinated movement of the other
//! keypoints (garment moved); otherwise it is treated as tracking jitter and
//! the last valid position is kept.

use nalgebra::{Point2, Vector2};

use crate::config::StabilizationConfig;
use crate::tracking::candidate::Candidate;

/// Per-side temporal memory. Reset on side switch or re-annotation.
#[derive(Debug, Clone)]
pub struct TrackingState {
    /// Last accepted position per keypoint; empty while uninitialized.
    pub last_valid: Vec<Option<Point2<f64>>>,
    pub consecutive_stable_frames: u32,
    pub is_stabilized: bool,
    /// Smoothed reference -> live scale estimate.
    pub last_detected_scale: f64,
}

impl TrackingState {
    pub fn new() -> Self {
        Self {
            last_valid: Vec::new(),
            consecutive_stable_frames: 0,
            is_stabilized: false,
            last_detected_scale: 1.0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.last_valid.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::new()
    }
}

/// What the filter did with one keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    /// Candidate position taken.
    Accepted,
    /// Large isolated jump; last valid position kept.
    JitterRejected,
    /// No candidate; last valid position kept.
    Held,
    /// No candidate and no memory.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizedPoint {
    pub position: Option<Point2<f64>>,
    pub status: PointStatus,
}

impl StabilizedPoint {
    /// True when the position came from this frame's candidate.
    /// Jitter-rejected and held points report a remembered position.
    pub fn is_tracked(&self) -> bool {
        self.status == PointStatus::Accepted
    }
}

pub struct StabilizationFilter {
    config: StabilizationConfig,
}

impl StabilizationFilter {
    pub fn new(config: StabilizationConfig) -> Self {
        Self { config }
    }

    /// Filter one frame of candidates, updating `state`.
    pub fn apply(&self, state: &mut TrackingState, candidates: &[Candidate]) -> Vec<StabilizedPoint> {
        if !state.is_initialized() || state.last_valid.len() != candidates.len() {
            if state.is_initialized() {
                tracing::info!(
                    "Keypoint count changed ({} -> {}), reinitializing stabilization",
                    state.last_valid.len(),
                    candidates.len()
                );
            }
            let scale = state.last_detected_scale;
            state.reset();
            state.last_detected_scale = scale;
            state.last_valid = candidates.iter().map(Candidate::position).collect();
            return candidates
                .iter()
                .map(|c| StabilizedPoint {
                    position: c.position(),
                    status: if c.is_located() {
                        PointStatus::Accepted
                    } else {
                        PointStatus::Unresolved
                    },
                })
                .collect();
        }

        let out: Vec<StabilizedPoint> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| self.filter_point(state, candidates, i, c))
            .collect();

        state.last_valid = out.iter().map(|p| p.position).collect();

        let all_accepted = out.iter().all(|p| p.status == PointStatus::Accepted);
        if all_accepted {
            state.consecutive_stable_frames += 1;
            if state.consecutive_stable_frames >= self.config.stable_frames_required {
                state.is_stabilized = true;
            }
        } else {
            state.consecutive_stable_frames = 0;
            state.is_stabilized = false;
        }
        out
    }

    fn filter_point(&self, state: &TrackingState, candidates: &[Candidate], i: usize, c: &Candidate) -> StabilizedPoint {
        let last = state.last_valid[i];
        let Some(new) = c.position() else {
            return StabilizedPoint {
                position: last,
                status: if last.is_some() {
                    PointStatus::Held
                } else {
                    PointStatus::Unresolved
                },
            };
        };
        let accepted = StabilizedPoint {
            position: Some(new),
            status: PointStatus::Accepted,
        };
        let Some(last) = last else {
            return accepted;
        };

        if (new - last).norm() < self.config.jump_threshold
            || self.is_coordinated_movement(state, candidates, i)
        {
            accepted
        } else {
            StabilizedPoint {
                position: Some(last),
                status: PointStatus::JitterRejected,
            }
        }
    }

    /// Decide whether keypoint `changed`'s jump is backed by the others.
    ///
    /// Other keypoints observable in both frames that moved more than
    /// `movement_threshold` are collected. With at least `min_coordinated` of
    /// them, the jump is genuine iff their mean cosine similarity to the mean
    /// displacement exceeds `cosine_threshold`. With fewer movers, the jump is
    /// accepted only if too few other keypoints are observable to judge.
    pub fn is_coordinated_movement(&self, state: &TrackingState, candidates: &[Candidate], changed: usize) -> bool {
        let mut observable = 0usize;
        let mut moves: Vec<Vector2<f64>> = Vec::new();
        for (j, (c, last)) in candidates.iter().zip(&state.last_valid).enumerate() {
            if j == changed {
                continue;
            }
            let (Some(new), Some(last)) = (c.position(), last) else {
                continue;
            };
            observable += 1;
            let d = new - last;
            if d.norm() > self.config.movement_threshold {
                moves.push(d);
            }
        }

        if moves.len() < self.config.min_coordinated {
            return observable < self.config.min_coordinated;
        }

        let mean = moves.iter().fold(Vector2::zeros(), |acc, d| acc + d) / moves.len() as f64;
        let mean_norm = mean.norm();
        if mean_norm == 0.0 {
            return false;
        }
        let consistency = moves
            .iter()
            .map(|d| d.dot(&mean) / (d.norm() * mean_norm))
            .sum::<f64>()
            / moves.len() as f64;
        consistency > self.config.cosine_threshold
    }
}
