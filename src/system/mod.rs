//! Session orchestration: the measurement loop and the state it shares.

pub mod measurement_loop;
pub mod session;
pub mod shared_state;

pub use measurement_loop::{run_measurement_loop, LoopStats};
pub use session::MeasurementSession;
pub use shared_state::SharedState;
