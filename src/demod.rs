//! Wideband FM demodulation down to the intermediate audio rate

use std::f64::consts::TAU;

use crate::{
    config::SessionConfig,
    filter::{low_pass, DecimatingFir, FilterError, WindowType},
    Sample,
};

/// Phase-difference discriminator.
///
/// Output is `gain * arg(x[n] * conj(x[n-1]))`, so with
/// `gain = fs / (2π * deviation)` a frequency offset of `deviation` reads as 1.0.
#[derive(Debug, Clone)]
pub struct QuadratureDemod {
    gain: f32,
    last: Sample,
}

impl QuadratureDemod {
    pub fn new(gain: f32) -> Self {
        Self {
            gain,
            last: Sample::new(0.0, 0.0),
        }
    }

    pub fn for_deviation(sample_rate: f64, deviation: f64) -> Self {
        Self::new((sample_rate / (TAU * deviation)) as f32)
    }

    pub fn demodulate(&mut self, input: &[Sample], output: &mut Vec<f32>) {
        output.extend(input.iter().map(|&x| {
            let d = x * self.last.conj();
            self.last = x;
            self.gain * d.arg()
        }));
    }
}

/// Single pole de-emphasis, `y[n] = (1 - a) x[n] + a y[n-1]` with `a = exp(-1/(tau fs))`
#[derive(Debug, Clone)]
pub struct Deemphasis {
    alpha: f32,
    y1: f32,
}

impl Deemphasis {
    pub fn new(tau: f64, sample_rate: f64) -> Self {
        Self {
            alpha: (-1.0 / (tau * sample_rate)).exp() as f32,
            y1: 0.0,
        }
    }

    pub fn process_inplace(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            self.y1 = (1.0 - self.alpha) * *s + self.alpha * self.y1;
            *s = self.y1;
        }
    }
}

pub struct FmDemodulator {
    quad: QuadratureDemod,
    lpf: DecimatingFir<f32>,
    deemph: Deemphasis,
    discriminated: Vec<f32>,
    audio_rate: f64,
}

impl FmDemodulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_rate: f64,
        audio_decimation: usize,
        deviation: f64,
        audio_pass: f64,
        audio_stop: f64,
        gain: f64,
        tau: f64,
    ) -> Result<Self, FilterError> {
        let taps = low_pass(
            gain,
            channel_rate,
            audio_pass,
            audio_stop - audio_pass,
            WindowType::Hamming,
        )?;
        let audio_rate = channel_rate / audio_decimation.max(1) as f64;
        Ok(Self {
            quad: QuadratureDemod::for_deviation(channel_rate, deviation),
            lpf: DecimatingFir::new(&taps, audio_decimation)?,
            deemph: Deemphasis::new(tau, audio_rate),
            discriminated: Vec::new(),
            audio_rate,
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, FilterError> {
        Self::new(
            config.channel_rate(),
            config.audio_decimation,
            config.deviation,
            config.audio_pass,
            config.audio_stop,
            1.0,
            config.tau,
        )
    }

    pub fn audio_rate(&self) -> f64 {
        self.audio_rate
    }

    /// Demodulate one block of channel samples, appending audio to `output`
    pub fn process(&mut self, input: &[Sample], output: &mut Vec<f32>) {
        self.discriminated.clear();
        self.quad.demodulate(input, &mut self.discriminated);
        let start = output.len();
        self.lpf.filter(&self.discriminated, output);
        self.deemph.process_inplace(&mut output[start..]);
    }
}
