//! Keypoint re-localization: where did each annotated landmark go in the live frame?

pub mod candidate;
pub mod corners;
pub mod direct;
pub mod features;
pub mod fusion;
pub mod pipeline;
pub mod result;
pub mod stabilization;
pub mod template;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use candidate::Candidate;
pub use features::{FeatureMatch, FeatureSet, FeatureTracker};
pub use pipeline::KeypointTracker;
pub use result::{PlacementMode, TrackedKeypoint, TransferResult};
pub use stabilization::{StabilizationFilter, TrackingState};
pub use transfer::TransferMethod;
