pub mod calibration;
pub mod engine;
pub mod equipment;
pub mod fallback;
pub mod meter;
pub mod season;
