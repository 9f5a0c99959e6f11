//! Frame acquisition.
//!
//! A `FrameSource` hands out grayscale frames with a bounded wait. Concrete
//! sources wrap an OpenCV capture device or a recorded image sequence;
//! `ThreadedSource` moves any source onto an I/O thread behind a single-slot
//! buffer so the measurement loop never blocks longer than its grab timeout.

pub mod capture;
pub mod grabber;
pub mod normalize;
pub mod sequence;
pub mod source;

pub use capture::CameraSource;
pub use grabber::ThreadedSource;
pub use normalize::ensure_grayscale;
pub use sequence::ImageSequenceSource;
pub use source::{init_with_retry, FrameSource};
