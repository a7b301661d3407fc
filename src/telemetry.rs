//! The 1 Hz survey logger: one GPS sentence and one RSSI value per line

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick, Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::SessionConfig,
    gps::{GpsSensor, GGA_SENSOR_PREFIX},
    probe::RssiProbe,
};

pub const LOG_HEADER: &str = "#gps_message RSSI(dBm)";
/// Written in place of the sentence when the GPS has nothing usable. Starts with
/// `#` so the mapper skips it like any other comment.
pub const GPS_PLACEHOLDER: &str = "#gps_unavailable";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("log file I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Starting,
    Running,
    Stopped,
}

/// `log_<frequency in Hz>_<unix start time>.txt`
pub fn log_file_name(rx_freq: f64, start: &DateTime<Utc>) -> String {
    format!("log_{}_{}.txt", rx_freq as i64, start.timestamp())
}

/// Create the session log in `dir` and write its header
pub fn create_log(
    dir: &Path,
    rx_freq: f64,
    start: &DateTime<Utc>,
) -> Result<(PathBuf, BufWriter<File>), TelemetryError> {
    let path = dir.join(log_file_name(rx_freq, start));
    let mut file = BufWriter::new(File::create(&path)?);
    writeln!(file, "{}", LOG_HEADER)?;
    file.flush()?;
    Ok((path, file))
}

/// Drop the sensor name the board puts in front of the sentence. The checksum stays.
pub fn strip_sensor_prefix(raw: &str) -> &str {
    raw.strip_prefix(GGA_SENSOR_PREFIX).unwrap_or(raw).trim()
}

pub fn format_record(gps: &str, rssi: f32) -> String {
    format!("{} {:.1}", gps, rssi)
}

pub struct TelemetryLogger<G, W> {
    gps: G,
    probe: RssiProbe,
    out: W,
    sensor: String,
    settle: Duration,
    period: Duration,
    state: LoggerState,
    records: u64,
}

impl<G: GpsSensor, W: Write> TelemetryLogger<G, W> {
    pub fn new(gps: G, probe: RssiProbe, out: W, config: &SessionConfig) -> Self {
        Self {
            gps,
            probe,
            out,
            sensor: config.gps_sensor.clone(),
            settle: config.settle,
            period: config.log_period,
            state: LoggerState::Starting,
            records: 0,
        }
    }

    pub fn state(&self) -> LoggerState {
        self.state
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Sample the GPS and the probe once and append the record
    pub fn tick(&mut self) -> Result<String, TelemetryError> {
        let gps = match self.gps.read_sensor(&self.sensor) {
            Ok(raw) => {
                let sentence = strip_sensor_prefix(&raw);
                if sentence.starts_with('$') {
                    sentence.to_owned()
                } else {
                    warn!(raw = %raw, "Malformed GPS reading");
                    GPS_PLACEHOLDER.to_owned()
                }
            }
            Err(e) => {
                warn!("GPS reading unavailable - {}", e);
                GPS_PLACEHOLDER.to_owned()
            }
        };
        let record = format_record(&gps, self.probe.read());
        writeln!(self.out, "{}", record)?;
        // Flushed every tick so a pulled power cable costs at most one record
        self.out.flush()?;
        self.records += 1;
        Ok(record)
    }

    /// Wait out the settle delay, then log once per period until `shutdown`
    /// fires or its sender goes away. `on_record` sees every line written.
    pub fn run<F: FnMut(&str)>(
        &mut self,
        shutdown: &Receiver<()>,
        mut on_record: F,
    ) -> Result<(), TelemetryError> {
        self.state = LoggerState::Starting;
        info!(settle = ?self.settle, "Waiting for the receiver to settle");
        if !matches!(
            shutdown.recv_timeout(self.settle),
            Err(RecvTimeoutError::Timeout)
        ) {
            return self.stop();
        }

        self.state = LoggerState::Running;
        info!(period = ?self.period, "Logging started");
        let ticker = tick(self.period);
        loop {
            let record = self.tick()?;
            on_record(&record);
            select! {
                recv(ticker) -> _ => {}
                recv(shutdown) -> _ => break,
            }
        }
        self.stop()
    }

    fn stop(&mut self) -> Result<(), TelemetryError> {
        self.out.flush()?;
        self.state = LoggerState::Stopped;
        info!(records = self.records, "Logging stopped");
        Ok(())
    }
}
