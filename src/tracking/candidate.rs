//! Per-keypoint estimator outcome.

use nalgebra::Point2;

use crate::error::FailureKind;

/// A position estimate for one keypoint, or why there is none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Candidate {
    Located(Point2<f64>),
    Missing(FailureKind),
}

impl Candidate {
    pub fn at(x: f64, y: f64) -> Self {
        Candidate::Located(Point2::new(x, y))
    }

    pub fn position(&self) -> Option<Point2<f64>> {
        match self {
            Candidate::Located(p) => Some(*p),
            Candidate::Missing(_) => None,
        }
    }

    pub fn is_located(&self) -> bool {
        matches!(self, Candidate::Located(_))
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            Candidate::Located(_) => None,
            Candidate::Missing(kind) => Some(*kind),
        }
    }
}

/// Number of located candidates.
pub fn count_located(candidates: &[Candidate]) -> usize {
    candidates.iter().filter(|c| c.is_located()).count()
}
