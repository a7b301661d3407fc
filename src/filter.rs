//! FIR filter design and the decimating FIR used by every rate-changing stage

use std::{
    f64::consts::PI,
    ops::{Add, Mul},
};

use num_traits::Zero;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("filter needs at least one tap")]
    NoTaps,
    #[error("invalid filter parameter {0}: {1}")]
    BadParameter(&'static str, f64),
}

/// Windows available for the windowed-sinc designer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowType {
    /// Approximate stopband attenuation in dB, used to size the filter
    pub fn max_attenuation(&self) -> f64 {
        match self {
            Self::Rectangular => 21.0,
            Self::Hann => 44.0,
            Self::Hamming => 53.0,
            Self::Blackman => 74.0,
        }
    }

    pub fn coefficients(&self, ntaps: usize) -> Vec<f64> {
        let m = (ntaps.max(2) - 1) as f64;
        (0..ntaps)
            .map(|n| {
                let x = 2.0 * PI * n as f64 / m;
                match self {
                    Self::Rectangular => 1.0,
                    Self::Hann => 0.5 - 0.5 * x.cos(),
                    Self::Hamming => 0.54 - 0.46 * x.cos(),
                    Self::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

/// Number of taps needed for a given transition width, always odd
pub fn compute_ntaps(sample_rate: f64, transition_width: f64, window: WindowType) -> usize {
    let ntaps = (window.max_attenuation() * sample_rate / (22.0 * transition_width)) as usize;
    ntaps | 1
}

/// Design a windowed-sinc low-pass filter with a DC gain of `gain`.
pub fn low_pass(
    gain: f64,
    sample_rate: f64,
    cutoff: f64,
    transition_width: f64,
    window: WindowType,
) -> Result<Vec<f32>, FilterError> {
    if !(sample_rate > 0.0) {
        return Err(FilterError::BadParameter("sample rate", sample_rate));
    }
    if !(cutoff > 0.0 && cutoff <= sample_rate / 2.0) {
        return Err(FilterError::BadParameter("cutoff", cutoff));
    }
    if !(transition_width > 0.0) {
        return Err(FilterError::BadParameter("transition width", transition_width));
    }
    let ntaps = compute_ntaps(sample_rate, transition_width, window);
    let w = window.coefficients(ntaps);
    let mid = (ntaps / 2) as isize;
    let fw_t0 = 2.0 * PI * cutoff / sample_rate;

    let mut taps: Vec<f64> = (0..ntaps)
        .map(|i| {
            let n = i as isize - mid;
            let sinc = if n == 0 {
                fw_t0 / PI
            } else {
                (n as f64 * fw_t0).sin() / (n as f64 * PI)
            };
            sinc * w[i]
        })
        .collect();

    // Normalize to the requested DC gain
    let dc: f64 = taps.iter().sum();
    for t in taps.iter_mut() {
        *t *= gain / dc;
    }
    Ok(taps.into_iter().map(|t| t as f32).collect())
}

/// Dot product of a window of samples with (reversed) taps
#[inline]
pub(crate) fn dot<T>(window: &[T], rev_taps: &[f32]) -> T
where
    T: Copy + Zero + Add<Output = T> + Mul<f32, Output = T>,
{
    window
        .iter()
        .zip(rev_taps)
        .fold(T::zero(), |acc, (&x, &h)| acc + x * h)
}

/// FIR filter that only evaluates the outputs it keeps.
///
/// One output is produced for every `decimation` inputs consumed, the first one
/// once the first full group has arrived. History carries over between calls so
/// blocks of any size can be fed in.
#[derive(Debug, Clone)]
pub struct DecimatingFir<T> {
    rev_taps: Vec<f32>,
    decimation: usize,
    /// The last `ntaps - 1` inputs, followed by the current block while filtering
    buf: Vec<T>,
    /// Offset into `buf` of the next output window
    skip: usize,
}

impl<T> DecimatingFir<T>
where
    T: Copy + Zero + Add<Output = T> + Mul<f32, Output = T>,
{
    pub fn new(taps: &[f32], decimation: usize) -> Result<Self, FilterError> {
        if taps.is_empty() {
            return Err(FilterError::NoTaps);
        }
        if decimation == 0 {
            return Err(FilterError::BadParameter("decimation", 0.0));
        }
        Ok(Self {
            rev_taps: taps.iter().rev().copied().collect(),
            decimation,
            buf: vec![T::zero(); taps.len() - 1],
            skip: decimation - 1,
        })
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    pub fn ntaps(&self) -> usize {
        self.rev_taps.len()
    }

    /// Filter `input`, appending the decimated result to `output`
    pub fn filter(&mut self, input: &[T], output: &mut Vec<T>) {
        let n = self.rev_taps.len();
        self.buf.extend_from_slice(input);
        let mut i = self.skip;
        while i + n <= self.buf.len() {
            output.push(dot(&self.buf[i..i + n], &self.rev_taps));
            i += self.decimation;
        }
        self.skip = i - input.len();
        self.buf.drain(..input.len());
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.resize(self.rev_taps.len() - 1, T::zero());
        self.skip = self.decimation - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    #[test]
    fn test_ntaps() {
        // 53 * 500e3 / (22 * 25e3) = 48.18 -> 49
        assert_eq!(compute_ntaps(500e3, 25e3, WindowType::Hamming), 49);
        assert_eq!(compute_ntaps(250e3, 1e3, WindowType::Hamming) % 2, 1);
    }

    #[test]
    fn test_low_pass_unity_dc_and_symmetric() {
        let taps = low_pass(1.0, 500e3, 100e3, 25e3, WindowType::Hamming).unwrap();
        let dc: f32 = taps.iter().sum();
        assert!((dc - 1.0).abs() < 1e-5);
        for (a, b) in taps.iter().zip(taps.iter().rev()) {
            assert!((a - b).abs() < 1e-7);
        }
    }

    #[test]
    fn test_low_pass_rejects_cutoff_above_nyquist() {
        assert_eq!(
            low_pass(1.0, 1000.0, 600.0, 10.0, WindowType::Hann),
            Err(FilterError::BadParameter("cutoff", 600.0))
        );
    }

    #[test]
    fn test_decimation_group() {
        let mut fir = DecimatingFir::<f32>::new(&[1.0], 4).unwrap();
        let mut out = vec![];
        fir.filter(&[1.0, 2.0, 3.0], &mut out);
        // Nothing until a full group of 4 has been consumed
        assert!(out.is_empty());
        fir.filter(&[4.0, 5.0], &mut out);
        assert_eq!(out, vec![4.0]);
        fir.filter(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &mut out);
        assert_eq!(out, vec![4.0, 8.0, 12.0]);
    }

    #[test]
    fn test_block_size_independent() {
        let taps = low_pass(1.0, 1000.0, 100.0, 50.0, WindowType::Blackman).unwrap();
        let input: Vec<Complex<f32>> = (0..1000)
            .map(|i| Complex::new((i as f32 * 0.05).sin(), (i as f32 * 0.03).cos()))
            .collect();

        let mut whole = DecimatingFir::new(&taps, 3).unwrap();
        let mut expected = vec![];
        whole.filter(&input, &mut expected);

        let mut pieces = DecimatingFir::new(&taps, 3).unwrap();
        let mut got = vec![];
        for chunk in input.chunks(7) {
            pieces.filter(chunk, &mut got);
        }
        assert_eq!(expected.len(), 333);
        assert_eq!(expected, got);
    }

    #[test]
    fn test_reset() {
        let mut fir = DecimatingFir::<f32>::new(&[0.5, 0.5], 1).unwrap();
        let mut out = vec![];
        fir.filter(&[2.0, 2.0], &mut out);
        fir.reset();
        out.clear();
        fir.filter(&[2.0], &mut out);
        assert_eq!(out, vec![1.0]);
    }
}
