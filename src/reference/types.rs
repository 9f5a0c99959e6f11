//! Small value types shared across the reference model.

use serde::{Deserialize, Serialize};

/// Which face of the garment is being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Front,
    Back,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Front => Side::Back,
            Side::Back => Side::Front,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Front => "front",
            Side::Back => "back",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 1-based index of a measurement pair.
///
/// Pair `n` joins keypoints `2(n-1)` and `2(n-1)+1`. Serialized as the bare
/// number so it can key JSON objects (`"3": 42.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairIndex(pub u32);

impl PairIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Pair that starts at keypoint `first` (0-based, even).
    pub fn from_first_keypoint(first: usize) -> Self {
        Self((first / 2 + 1) as u32)
    }

    /// 0-based keypoint indices joined by this pair.
    pub fn keypoint_indices(self) -> (usize, usize) {
        let first = (self.0.saturating_sub(1) as usize) * 2;
        (first, first + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PairIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Corner keypoints sit on garment boundaries and get dedicated refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointRole {
    Corner,
    Regular,
}

impl KeypointRole {
    pub fn for_index(index: usize, corner_count: usize) -> Self {
        if index < corner_count {
            KeypointRole::Corner
        } else {
            KeypointRole::Regular
        }
    }
}
