//! Channel selection: shift the wanted channel to baseband, low-pass it and decimate.
//!
//! The hardware is deliberately tuned `lo_offset` below the channel, so the channel
//! sits at `+lo_offset` in the raw stream. The cutoff must be wide enough that the
//! shifted channel lands fully in the passband; that is a property of the
//! configuration and is not checked here.

use std::f64::consts::TAU;

use num_complex::Complex;

use crate::{
    config::SessionConfig,
    filter::{low_pass, DecimatingFir, FilterError},
    Sample,
};

/// Numerically controlled oscillator mixing a stream by `exp(-j2πfn/fs)`
#[derive(Debug, Clone)]
pub struct Rotator {
    phase: f64,
    phase_inc: f64,
}

impl Rotator {
    pub fn new(freq: f64, sample_rate: f64) -> Self {
        Self {
            phase: 0.0,
            phase_inc: -TAU * freq / sample_rate,
        }
    }

    pub fn rotate(&mut self, input: &[Sample], output: &mut Vec<Sample>) {
        output.extend(input.iter().map(|&x| {
            let (sin, cos) = self.phase.sin_cos();
            self.phase = (self.phase + self.phase_inc) % TAU;
            x * Complex::new(cos as f32, sin as f32)
        }));
    }
}

pub struct ChannelSelector {
    rotator: Rotator,
    fir: DecimatingFir<Sample>,
    mixed: Vec<Sample>,
    output_rate: f64,
}

impl ChannelSelector {
    pub fn new(
        taps: &[f32],
        center_freq: f64,
        sample_rate: f64,
        decimation: usize,
    ) -> Result<Self, FilterError> {
        Ok(Self {
            rotator: Rotator::new(center_freq, sample_rate),
            fir: DecimatingFir::new(taps, decimation)?,
            mixed: Vec::new(),
            output_rate: sample_rate / decimation.max(1) as f64,
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, FilterError> {
        let taps = low_pass(
            1.0,
            config.src_samp_rate,
            config.channel_cutoff,
            config.channel_transition,
            config.channel_window,
        )?;
        Self::new(
            &taps,
            config.lo_offset,
            config.src_samp_rate,
            config.channel_decimation,
        )
    }

    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    /// Process one block of raw samples, appending the channel samples to `output`
    pub fn process(&mut self, input: &[Sample], output: &mut Vec<Sample>) {
        self.mixed.clear();
        self.rotator.rotate(input, &mut self.mixed);
        self.fir.filter(&self.mixed, output);
    }
}
