//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::config::SessionConfig;

/// Drive a receiver around and log calibrated RSSI against GPS position once a second
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
pub struct Args {
    /// Channel frequency in Hz, k/M/G suffixes accepted (e.g. 98.9M)
    #[clap(short, long, default_value_t = 98.9e6, value_parser = parse_frequency)]
    pub frequency: f64,
    /// Receiver device arguments (`type=tone[,offset=..,amplitude=..]` or `file=<path>`)
    #[clap(short, long, default_value = "type=tone")]
    pub args: String,
    /// RSSI calibration offset (dB)
    #[clap(short, long, default_value_t = -50.0, allow_hyphen_values = true)]
    pub cal: f64,
    /// Front-end gain (dB)
    #[clap(short, long, default_value_t = 50.0)]
    pub gain: f64,
    /// Audio volume (dB)
    #[clap(short = 'V', long, default_value_t = 30.0, allow_hyphen_values = true)]
    pub volume: f64,
    /// Sound card sample rate (Hz)
    #[clap(short, long, default_value_t = 48000)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub soundrate: u32,
    /// NMEA GPS device or recording to read fixes from
    #[clap(long)]
    pub gps: Option<PathBuf>,
    /// Pace the GPS input at one sentence per second, for replaying recordings
    #[clap(long)]
    pub gps_replay: bool,
    /// Write demodulated audio to a WAV file, or raw f32 PCM to stdout with `-`
    #[clap(long)]
    pub audio: Option<String>,
    /// Directory the survey log is written to
    #[clap(short = 'o', long, default_value = ".")]
    pub log_dir: PathBuf,
    /// Seconds to let the receiver settle before the first record
    #[clap(long, default_value = "2", value_parser = parse_seconds)]
    pub settle: Duration,
    /// Capture ring buffer capacity, in blocks
    #[clap(long, default_value_t = 256)]
    pub capacity: usize,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            rx_freq: self.frequency,
            src_gain_db: self.gain,
            rssi_cal_offset_db: self.cal,
            volume_db: self.volume,
            snd_card_rate: self.soundrate as f64,
            settle: self.settle,
            log_dir: self.log_dir.clone(),
            ..Default::default()
        }
    }
}

/// Render a survey log as a colour-coded map
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct MapArgs {
    /// Survey log written by rssi_survey
    pub log: PathBuf,
    /// Where to write the map, defaults to the log path with an .html extension
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

/// Hz with an optional engineering suffix: `98.9M`, `500k`, `1.2G`
fn parse_frequency(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (num, scale) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1e3),
        Some('M') => (&s[..s.len() - 1], 1e6),
        Some('G' | 'g') => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    let v: f64 = num
        .parse()
        .map_err(|_| format!("Invalid frequency {:?}", s))?;
    if v <= 0.0 || !v.is_finite() {
        return Err("Frequency must be positive".to_string());
    }
    Ok(v * scale)
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let v: f64 = s.parse().map_err(|_| "Invalid number of seconds".to_string())?;
    if v < 0.0 || !v.is_finite() {
        return Err("Seconds must not be negative".to_string());
    }
    Ok(Duration::from_secs_f64(v))
}
