use num_complex::Complex;

pub mod args;
pub mod audio;
pub mod capture;
pub mod channel;
pub mod config;
pub mod demod;
pub mod filter;
pub mod gps;
pub mod monitoring;
pub mod pipeline;
pub mod power;
pub mod probe;
pub mod survey;
pub mod telemetry;

/// Complex baseband sample as delivered by the receiver
pub type Sample = Complex<f32>;

/// Samples per block read from the source
pub const BLOCK_SIZE: usize = 8192;
