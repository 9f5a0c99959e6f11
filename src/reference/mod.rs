//! Reference model: what the operator annotated, and how the station is calibrated.
//!
//! Records on disk (`annotation`, `calibration`) are plain serde structs; they
//! are validated into typed values (`ReferenceSide`, `Calibration`) on load.

pub mod annotation;
pub mod calibration;
pub mod model;
pub mod types;

pub use annotation::{AnnotationRecord, PlacementBox};
pub use calibration::{Calibration, CalibrationRecord};
pub use model::{Keypoint, ReferenceModel, ReferenceSide};
pub use types::{KeypointRole, PairIndex, Side};
