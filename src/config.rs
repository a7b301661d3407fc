//! Session configuration, fixed at start-up and handed to every stage constructor.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::filter::WindowType;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be positive, got {1}")]
    NotPositive(&'static str, f64),
    #[error("{0} must be at least 1")]
    ZeroDecimation(&'static str),
    #[error("{name} of {rate} Hz is not an integer sample rate")]
    FractionalRate { name: &'static str, rate: f64 },
    #[error("audio stopband ({stop} Hz) must lie above the passband ({pass} Hz)")]
    InvertedAudioBand { pass: f64, stop: f64 },
}

/// Everything the streaming pipeline and the logger need to know about a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Desired channel frequency (Hz)
    pub rx_freq: f64,
    /// Hardware is tuned this far below the channel to keep it off the DC spike (Hz)
    pub lo_offset: f64,
    /// Front-end sample rate (Hz)
    pub src_samp_rate: f64,
    /// Front-end gain (dB)
    pub src_gain_db: f64,
    /// RSSI calibration offset (dB)
    pub rssi_cal_offset_db: f64,
    /// Audio volume (dB)
    pub volume_db: f64,
    /// Sound card rate (Hz)
    pub snd_card_rate: f64,
    pub channel_decimation: usize,
    pub channel_cutoff: f64,
    pub channel_transition: f64,
    pub channel_window: WindowType,
    pub audio_decimation: usize,
    /// Maximum FM deviation (Hz)
    pub deviation: f64,
    pub audio_pass: f64,
    pub audio_stop: f64,
    /// De-emphasis time constant (s)
    pub tau: f64,
    /// How long the logger waits after the pipeline starts before the first record
    pub settle: Duration,
    pub log_period: Duration,
    pub log_dir: PathBuf,
    /// Sensor queried on the GPS interface each tick
    pub gps_sensor: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rx_freq: 98.9e6,
            lo_offset: 125e3,
            src_samp_rate: 500e3,
            src_gain_db: 50.0,
            rssi_cal_offset_db: -50.0,
            volume_db: 30.0,
            snd_card_rate: 48e3,
            channel_decimation: 2,
            channel_cutoff: 100e3,
            channel_transition: 25e3,
            channel_window: WindowType::Hamming,
            audio_decimation: 5,
            deviation: 75e3,
            audio_pass: 15e3,
            audio_stop: 16e3,
            tau: 75e-6,
            settle: Duration::from_secs(2),
            log_period: Duration::from_secs(1),
            log_dir: PathBuf::from("."),
            gps_sensor: "gps_gpgga".to_owned(),
        }
    }
}

fn positive(name: &'static str, v: f64) -> Result<(), ConfigError> {
    if v > 0.0 && v.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotPositive(name, v))
    }
}

fn integral(name: &'static str, rate: f64) -> Result<(), ConfigError> {
    if rate.fract() == 0.0 {
        Ok(())
    } else {
        Err(ConfigError::FractionalRate { name, rate })
    }
}

/// Greatest common divisor
pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("rx frequency", self.rx_freq)?;
        positive("source sample rate", self.src_samp_rate)?;
        positive("sound card rate", self.snd_card_rate)?;
        positive("channel cutoff", self.channel_cutoff)?;
        positive("channel transition width", self.channel_transition)?;
        positive("deviation", self.deviation)?;
        positive("audio passband", self.audio_pass)?;
        positive("de-emphasis tau", self.tau)?;
        positive("logging period", self.log_period.as_secs_f64())?;
        if self.channel_decimation == 0 {
            return Err(ConfigError::ZeroDecimation("channel decimation"));
        }
        if self.audio_decimation == 0 {
            return Err(ConfigError::ZeroDecimation("audio decimation"));
        }
        if self.audio_stop <= self.audio_pass {
            return Err(ConfigError::InvertedAudioBand {
                pass: self.audio_pass,
                stop: self.audio_stop,
            });
        }
        integral("source sample rate", self.src_samp_rate)?;
        integral("sound card rate", self.snd_card_rate)?;
        integral("channel rate", self.channel_rate())?;
        integral("audio rate", self.audio_rate())?;
        Ok(())
    }

    /// Frequency actually set on the hardware
    pub fn tuned_freq(&self) -> f64 {
        self.rx_freq - self.lo_offset
    }

    /// Rate out of the channel selector
    pub fn channel_rate(&self) -> f64 {
        self.src_samp_rate / self.channel_decimation as f64
    }

    /// Rate out of the FM demodulator
    pub fn audio_rate(&self) -> f64 {
        self.channel_rate() / self.audio_decimation as f64
    }

    /// Number of channel samples summed per RSSI estimate (one estimate per logging period)
    pub fn integration_len(&self) -> usize {
        ((self.channel_rate() * self.log_period.as_secs_f64()).round() as usize).max(1)
    }

    /// Calibration and front-end gain folded into the one additive term of the dB conversion
    pub fn rssi_offset_db(&self) -> f32 {
        (self.rssi_cal_offset_db - self.src_gain_db) as f32
    }

    pub fn volume_gain(&self) -> f32 {
        crate::audio::volume_gain(self.volume_db as f32)
    }

    /// (interpolation, decimation) taking the audio rate to the sound card rate, in lowest terms
    pub fn resampler_ratio(&self) -> (usize, usize) {
        let interp = self.snd_card_rate as usize;
        let decim = self.audio_rate() as usize;
        let g = gcd(interp, decim).max(1);
        (interp / g, decim / g)
    }
}
