//! This module contains all the capture logic

// The capture thread does one thing, as fast as the source allows: pull blocks
// from the receiver and push them into an rtrb ring buffer. Processing happens
// on other threads. If the ring is full the block is dropped, the receiver is
// never made to wait.

use std::{
    collections::BTreeMap,
    f64::consts::TAU,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use byte_slice_cast::AsMutByteSlice;
use thiserror::Error;
use tracing::{debug, info};

use crate::{monitoring::PipelineStats, Sample, BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("sample source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported device type {0:?}")]
    UnsupportedDevice(String),
    #[error("bad device argument {key}={value}")]
    BadDeviceArg { key: String, value: String },
    #[error("sample source read before it was configured")]
    NotConfigured,
}

/// A receiver front end producing complex baseband samples
pub trait SampleSource: Send {
    /// Set rate (Hz), hardware center frequency (Hz) and gain (dB)
    fn configure(&mut self, sample_rate: f64, center_freq: f64, gain_db: f64)
        -> Result<(), CaptureError>;

    /// Fill `buf`, returning the number of samples written. Zero means the stream ended.
    fn read(&mut self, buf: &mut [Sample]) -> Result<usize, CaptureError>;
}

/// Sleeps so that samples are handed out no faster than real time
#[derive(Debug, Clone)]
pub struct Throttle {
    rate: f64,
    start: Option<Instant>,
    samples: u64,
}

impl Throttle {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            start: None,
            samples: 0,
        }
    }

    pub fn pace(&mut self, n: usize) {
        let start = *self.start.get_or_insert_with(Instant::now);
        self.samples += n as u64;
        let due = start + Duration::from_secs_f64(self.samples as f64 / self.rate);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
    }
}

/// Synthetic receiver: one carrier `offset` Hz above the tuned center.
///
/// `amplitude` is referred to the antenna, the configured gain is applied on top
/// like a real front end would.
#[derive(Debug, Clone)]
pub struct ToneSource {
    offset: f64,
    amplitude: f32,
    limit: Option<u64>,
    realtime: bool,
    scale: f32,
    phase: f64,
    phase_inc: Option<f64>,
    produced: u64,
    throttle: Option<Throttle>,
}

impl ToneSource {
    pub fn new(offset: f64, amplitude: f32) -> Self {
        Self {
            offset,
            amplitude,
            limit: None,
            realtime: true,
            scale: amplitude,
            phase: 0.0,
            phase_inc: None,
            produced: 0,
            throttle: None,
        }
    }

    /// Stop after `samples` samples
    pub fn with_limit(mut self, samples: u64) -> Self {
        self.limit = Some(samples);
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl SampleSource for ToneSource {
    fn configure(
        &mut self,
        sample_rate: f64,
        _center_freq: f64,
        gain_db: f64,
    ) -> Result<(), CaptureError> {
        self.phase_inc = Some(TAU * self.offset / sample_rate);
        self.scale = self.amplitude * 10f32.powf(gain_db as f32 / 20.0);
        self.throttle = self.realtime.then(|| Throttle::new(sample_rate));
        Ok(())
    }

    fn read(&mut self, buf: &mut [Sample]) -> Result<usize, CaptureError> {
        let phase_inc = self.phase_inc.ok_or(CaptureError::NotConfigured)?;
        let n = match self.limit {
            Some(limit) => buf.len().min((limit - self.produced) as usize),
            None => buf.len(),
        };
        for s in buf[..n].iter_mut() {
            let (sin, cos) = self.phase.sin_cos();
            *s = Sample::new(cos as f32, sin as f32) * self.scale;
            self.phase = (self.phase + phase_inc) % TAU;
        }
        self.produced += n as u64;
        if let Some(throttle) = self.throttle.as_mut() {
            throttle.pace(n);
        }
        Ok(n)
    }
}

/// Replays a recording of interleaved native-endian f32 I/Q pairs
pub struct IqFileSource<R: Read + Send> {
    reader: R,
    scratch: Vec<f32>,
    realtime: bool,
    throttle: Option<Throttle>,
}

impl IqFileSource<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read + Send> IqFileSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scratch: Vec::new(),
            realtime: true,
            throttle: None,
        }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl<R: Read + Send> SampleSource for IqFileSource<R> {
    fn configure(
        &mut self,
        sample_rate: f64,
        _center_freq: f64,
        _gain_db: f64,
    ) -> Result<(), CaptureError> {
        self.throttle = self.realtime.then(|| Throttle::new(sample_rate));
        Ok(())
    }

    fn read(&mut self, buf: &mut [Sample]) -> Result<usize, CaptureError> {
        self.scratch.resize(buf.len() * 2, 0.0);
        let bytes = self.scratch.as_mut_byte_slice();
        let mut filled = 0;
        while filled < bytes.len() {
            match self.reader.read(&mut bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // A trailing partial sample at the end of the file is dropped
        let n = filled / std::mem::size_of::<Sample>();
        for (s, iq) in buf.iter_mut().zip(self.scratch.chunks_exact(2)).take(n) {
            *s = Sample::new(iq[0], iq[1]);
        }
        if let Some(throttle) = self.throttle.as_mut() {
            throttle.pace(n);
        }
        Ok(n)
    }
}

/// Split a `key=value,key=value` device string
pub fn parse_device_args(args: &str) -> BTreeMap<String, String> {
    args.split(',')
        .map(str::trim)
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.trim().to_owned(), v.trim().to_owned()),
            None => (kv.to_owned(), String::new()),
        })
        .collect()
}

fn arg<T: std::str::FromStr>(
    map: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, CaptureError> {
    map.get(key)
        .map(|v| {
            v.parse().map_err(|_| CaptureError::BadDeviceArg {
                key: key.to_owned(),
                value: v.clone(),
            })
        })
        .transpose()
}

/// Open the source named by a device string.
///
/// `file=<path>` replays a recording, `type=tone` synthesizes a carrier
/// (`offset`, `amplitude`, `limit` optional). `realtime=false` disables pacing.
pub fn open_source(args: &str) -> Result<Box<dyn SampleSource>, CaptureError> {
    let map = parse_device_args(args);
    let realtime = arg::<bool>(&map, "realtime")?.unwrap_or(true);
    if let Some(path) = map.get("file") {
        info!(path = %path, "Replaying I/Q recording");
        return Ok(Box::new(IqFileSource::open(path)?.with_realtime(realtime)));
    }
    match map.get("type").map(String::as_str).unwrap_or("tone") {
        "tone" => {
            let offset = arg(&map, "offset")?.unwrap_or(125e3);
            let amplitude = arg(&map, "amplitude")?.unwrap_or(1e-4);
            let mut source = ToneSource::new(offset, amplitude).with_realtime(realtime);
            if let Some(limit) = arg(&map, "limit")? {
                source = source.with_limit(limit);
            }
            debug!(offset, amplitude, "Synthesizing test carrier");
            Ok(Box::new(source))
        }
        other => Err(CaptureError::UnsupportedDevice(other.to_owned())),
    }
}

/// Pull blocks from `source` until it runs dry or `stop` is raised.
pub fn capture_samples(
    mut source: Box<dyn SampleSource>,
    mut producer: rtrb::Producer<Vec<Sample>>,
    stop: &AtomicBool,
    stats: &PipelineStats,
) -> Result<(), CaptureError> {
    while !stop.load(Ordering::Relaxed) {
        let mut block = vec![Sample::new(0.0, 0.0); BLOCK_SIZE];
        let n = source.read(&mut block)?;
        if n == 0 {
            info!("Sample source exhausted");
            break;
        }
        block.truncate(n);
        stats.captured(n);
        // Keep truckin, a full ring means a stage fell behind, not that we should wait
        if producer.push(block).is_err() {
            stats.capture_overflow();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byte_slice_cast::AsByteSlice;
    use std::io::Cursor;

    #[test]
    fn test_device_args() {
        let map = parse_device_args("type=tone, amplitude=0.5,realtime=false");
        assert_eq!(map.get("type").unwrap(), "tone");
        assert_eq!(map.get("amplitude").unwrap(), "0.5");
        assert!(open_source("type=b200").is_err());
        assert!(matches!(
            open_source("type=tone,amplitude=loud"),
            Err(CaptureError::BadDeviceArg { .. })
        ));
    }

    #[test]
    fn test_tone_source_power_includes_gain() {
        let mut src = ToneSource::new(125e3, 0.1).with_realtime(false);
        let mut buf = vec![Sample::new(0.0, 0.0); 16];
        assert!(matches!(src.read(&mut buf), Err(CaptureError::NotConfigured)));
        src.configure(500e3, 98.775e6, 20.0).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 16);
        for s in &buf {
            assert!((s.norm() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_tone_source_limit() {
        let mut src = ToneSource::new(0.0, 1.0)
            .with_limit(20)
            .with_realtime(false);
        src.configure(1000.0, 0.0, 0.0).unwrap();
        let mut buf = vec![Sample::new(0.0, 0.0); 16];
        assert_eq!(src.read(&mut buf).unwrap(), 16);
        assert_eq!(src.read(&mut buf).unwrap(), 4);
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_iq_file_source() {
        let raw = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut bytes = raw.as_byte_slice().to_vec();
        // Dangling half sample
        bytes.extend_from_slice(&7.0f32.to_ne_bytes());
        let mut src = IqFileSource::new(Cursor::new(bytes)).with_realtime(false);
        src.configure(1e3, 0.0, 0.0).unwrap();
        let mut buf = vec![Sample::new(0.0, 0.0); 8];
        assert_eq!(src.read(&mut buf).unwrap(), 3);
        assert_eq!(buf[2], Sample::new(5.0, 6.0));
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_capture_drops_when_ring_full() {
        let src = ToneSource::new(0.0, 1.0)
            .with_limit(BLOCK_SIZE as u64 * 5)
            .with_realtime(false);
        let mut src: Box<dyn SampleSource> = Box::new(src);
        src.configure(1e6, 0.0, 0.0).unwrap();
        let (producer, mut consumer) = rtrb::RingBuffer::new(2);
        let stats = PipelineStats::default();
        capture_samples(src, producer, &AtomicBool::new(false), &stats).unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.blocks_captured, 5);
        assert_eq!(snap.capture_overflows, 3);
        assert!(consumer.pop().is_ok());
        assert!(consumer.pop().is_ok());
        assert!(consumer.pop().is_err());
    }
}
