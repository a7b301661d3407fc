//! Audio conditioning: resample to the sound card rate, apply volume, hand off to a sink

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use byte_slice_cast::AsByteSlice;
use thiserror::Error;

use crate::{
    config::{gcd, SessionConfig},
    filter::{dot, low_pass, FilterError, WindowType},
};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV writer error: {0}")]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Linear volume multiplier.
///
/// This is `10^(dB/20) - 1`, not the plain dB-to-amplitude conversion; 0 dB mutes.
pub fn volume_gain(volume_db: f32) -> f32 {
    10f32.powf(volume_db / 20.0) - 1.0
}

/// Polyphase rational resampler, `interpolation / decimation` in lowest terms
#[derive(Debug, Clone)]
pub struct RationalResampler {
    interpolation: usize,
    decimation: usize,
    /// One reversed sub-filter per output phase
    branches: Vec<Vec<f32>>,
    buf: Vec<f32>,
    ctr: usize,
    skip: usize,
}

impl RationalResampler {
    pub fn new(interpolation: usize, decimation: usize) -> Result<Self, FilterError> {
        if interpolation == 0 || decimation == 0 {
            return Err(FilterError::BadParameter(
                "resampling ratio",
                interpolation as f64 / decimation as f64,
            ));
        }
        let g = gcd(interpolation, decimation);
        let (interp, decim) = (interpolation / g, decimation / g);
        Self::with_taps(interp, decim, &design_taps(interp, decim, 0.4)?)
    }

    pub fn with_taps(interp: usize, decim: usize, taps: &[f32]) -> Result<Self, FilterError> {
        if taps.is_empty() {
            return Err(FilterError::NoTaps);
        }
        let per_branch = (taps.len() + interp - 1) / interp;
        let branches: Vec<Vec<f32>> = (0..interp)
            .map(|p| {
                let mut b: Vec<f32> = (0..per_branch)
                    .map(|k| taps.get(p + k * interp).copied().unwrap_or(0.0))
                    .collect();
                b.reverse();
                b
            })
            .collect();
        Ok(Self {
            interpolation: interp,
            decimation: decim,
            branches,
            buf: vec![0.0; per_branch - 1],
            ctr: 0,
            skip: 0,
        })
    }

    pub fn ratio(&self) -> (usize, usize) {
        (self.interpolation, self.decimation)
    }

    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let k = self.branches[0].len();
        self.buf.extend_from_slice(input);
        let mut i = self.skip;
        while i + k <= self.buf.len() {
            output.push(dot(&self.buf[i..i + k], &self.branches[self.ctr]));
            self.ctr += self.decimation;
            i += self.ctr / self.interpolation;
            self.ctr %= self.interpolation;
        }
        self.skip = i - input.len();
        self.buf.drain(..input.len());
    }
}

/// Anti-aliasing/anti-imaging low-pass for an `interp/decim` resampler
fn design_taps(interp: usize, decim: usize, fractional_bw: f64) -> Result<Vec<f32>, FilterError> {
    let halfband = 0.5;
    let rate = interp as f64 / decim as f64;
    let (trans_width, mid_transition) = if rate >= 1.0 {
        let tw = halfband - fractional_bw;
        (tw, halfband - tw / 2.0)
    } else {
        let tw = rate * (halfband - fractional_bw);
        (tw, rate * halfband - tw / 2.0)
    };
    low_pass(
        interp as f64,
        interp as f64,
        mid_transition,
        trans_width,
        WindowType::Blackman,
    )
}

/// Where conditioned audio ends up
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<(), AudioError>;

    /// Called once when the pipeline shuts down
    fn finish(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Discards everything, for unattended surveys
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32]) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Mono 32-bit float WAV recording
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self, AudioError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        Ok(Self {
            writer: Some(hound::WavWriter::create(path, spec)?),
        })
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.as_mut() {
            for &s in samples {
                writer.write_sample(s)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

/// Native-endian f32 PCM to any writer, e.g. stdout piped into a player
pub struct RawSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> RawSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> AudioSink for RawSink<W> {
    fn write(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        self.out.write_all(samples.as_byte_slice())?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), AudioError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Pick a sink from the command line: nothing, `-` for stdout, or a WAV path
pub fn open_sink(target: Option<&str>, sample_rate: u32) -> Result<Box<dyn AudioSink>, AudioError> {
    Ok(match target {
        None => Box::new(NullSink),
        Some("-") => Box::new(RawSink::new(std::io::stdout())),
        Some(path) => Box::new(WavSink::create(path, sample_rate)?),
    })
}

/// Resampler, volume and sink, run on the audio branch thread
pub struct AudioChain {
    resampler: RationalResampler,
    gain: f32,
    sink: Box<dyn AudioSink>,
    scratch: Vec<f32>,
}

impl AudioChain {
    pub fn new(resampler: RationalResampler, gain: f32, sink: Box<dyn AudioSink>) -> Self {
        Self {
            resampler,
            gain,
            sink,
            scratch: Vec::new(),
        }
    }

    pub fn from_config(config: &SessionConfig, sink: Box<dyn AudioSink>) -> Result<Self, AudioError> {
        let (interp, decim) = config.resampler_ratio();
        Ok(Self::new(
            RationalResampler::new(interp, decim)?,
            config.volume_gain(),
            sink,
        ))
    }

    pub fn process(&mut self, audio: &[f32]) -> Result<(), AudioError> {
        self.scratch.clear();
        self.resampler.process(audio, &mut self.scratch);
        for s in self.scratch.iter_mut() {
            *s *= self.gain;
        }
        self.sink.write(&self.scratch)
    }

    pub fn finish(&mut self) -> Result<(), AudioError> {
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        f32::consts::TAU,
        sync::{Arc, Mutex},
    };

    #[test]
    fn test_volume_gain_offset_by_one() {
        assert_eq!(volume_gain(0.0), 0.0);
        assert!((volume_gain(20.0) - 9.0).abs() < 1e-5);
        assert!((volume_gain(30.0) - 30.622776).abs() < 1e-3);
    }

    #[test]
    fn test_resampler_rate() {
        let mut rs = RationalResampler::new(48000, 50000).unwrap();
        assert_eq!(rs.ratio(), (24, 25));
        let mut out = vec![];
        for _ in 0..10 {
            rs.process(&vec![0.0; 5000], &mut out);
        }
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn test_resampler_preserves_tone_amplitude() {
        let mut rs = RationalResampler::new(48000, 50000).unwrap();
        let input: Vec<f32> = (0..50_000)
            .map(|i| (TAU * 1000.0 * i as f32 / 50_000.0).sin())
            .collect();
        let mut out = vec![];
        for block in input.chunks(1234) {
            rs.process(block, &mut out);
        }
        let tail = &out[out.len() - 4800..];
        let peak = tail.iter().fold(0f32, |m, v| m.max(v.abs()));
        assert!((peak - 1.0).abs() < 0.02, "{}", peak);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<f32>>>);

    impl AudioSink for Capture {
        fn write(&mut self, samples: &[f32]) -> Result<(), AudioError> {
            self.0.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }

    #[test]
    fn test_chain_applies_gain() {
        let captured = Capture::default();
        let rs = RationalResampler::with_taps(1, 1, &[1.0]).unwrap();
        let mut chain = AudioChain::new(rs, volume_gain(20.0), Box::new(captured.clone()));
        chain.process(&[0.5, -0.5]).unwrap();
        let got = captured.0.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert!((got[0] - 4.5).abs() < 1e-4);
        assert!((got[1] + 4.5).abs() < 1e-4);
    }

    #[test]
    fn test_wav_sink_readable_after_drop() {
        let path = std::env::temp_dir().join(format!("rssi_survey_wav_{}.wav", std::process::id()));
        {
            let mut sink = open_sink(path.to_str(), 48000).unwrap();
            sink.write(&[0.25; 100]).unwrap();
            // Dropped without finish, as on an early exit
        }
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.len(), 100);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_raw_sink_bytes() {
        let mut sink = RawSink::new(Vec::new());
        sink.write(&[1.0, -2.0]).unwrap();
        assert_eq!(sink.out.len(), 8);
        assert_eq!(&sink.out[..4], &1.0f32.to_ne_bytes());
    }
}
