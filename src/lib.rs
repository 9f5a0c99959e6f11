pub mod camera;
pub mod config;
pub mod error;
pub mod measurement;
pub mod reference;
pub mod system;
pub mod tracking;
