//! Pixel distances -> centimeters -> pass/fail, and the live snapshot boundary.

pub mod engine;
pub mod snapshot;
pub mod writer;

pub use engine::{pairs, MeasurementEngine, MeasurementPair, MeasurementRecord, QcVerdict};
pub use snapshot::LiveSnapshot;
pub use writer::LiveStateWriter;
