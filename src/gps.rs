//! GPS sensor interface and NMEA GGA parsing

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GpsError {
    #[error("no GPS sentence received yet")]
    NoData,
    #[error("GPS stream closed")]
    Disconnected,
    #[error("unknown sensor {0:?}")]
    UnknownSensor(String),
    #[error("GPS device I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,
    #[error("checksum mismatch: sentence says {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("malformed checksum {0:?}")]
    BadChecksum(String),
    #[error("not a GGA sentence: {0:?}")]
    Unsupported(String),
    #[error("sentence is missing the {0} field")]
    MissingField(&'static str),
    #[error("bad {field} value {value:?}")]
    BadNumber { field: &'static str, value: String },
}

/// Something that can be asked for a named sensor reading, like a receiver's GPS
pub trait GpsSensor {
    fn read_sensor(&mut self, name: &str) -> Result<String, GpsError>;
}

impl<T: GpsSensor + ?Sized> GpsSensor for Box<T> {
    fn read_sensor(&mut self, name: &str) -> Result<String, GpsError> {
        (**self).read_sensor(name)
    }
}

/// The readout prefix a board sensor puts in front of the GGA sentence
pub const GGA_SENSOR_PREFIX: &str = "GPS_GPGGA: ";

/// One GGA position report
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    /// Decimal degrees, south negative
    pub latitude: f64,
    /// Decimal degrees, west negative
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub altitude_units: String,
    /// The sentence as received, checksum included
    pub raw: String,
}

/// XOR of every byte between `$` and `*`
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// `ddmm.mmmm` (or `dddmm.mmmm`) plus hemisphere to signed decimal degrees
fn parse_coordinate(
    field: &'static str,
    value: &str,
    hemisphere: &str,
    negative: &str,
) -> Result<f64, NmeaError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    let v: f64 = value.parse().map_err(|_| NmeaError::BadNumber {
        field,
        value: value.to_owned(),
    })?;
    let degrees = (v / 100.0).trunc();
    let decimal = degrees + (v - degrees * 100.0) / 60.0;
    Ok(if hemisphere == negative {
        -decimal
    } else {
        decimal
    })
}

impl GpsFix {
    /// Parse a `$..GGA` sentence. A checksum, when present, must match.
    pub fn parse(sentence: &str) -> Result<Self, NmeaError> {
        let raw = sentence.trim();
        let body = raw.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
        let body = match body.split_once('*') {
            Some((body, cs)) => {
                let expected = u8::from_str_radix(cs.trim(), 16)
                    .map_err(|_| NmeaError::BadChecksum(cs.to_owned()))?;
                let computed = nmea_checksum(body);
                if expected != computed {
                    return Err(NmeaError::Checksum { expected, computed });
                }
                body
            }
            None => body,
        };

        let fields: Vec<&str> = body.split(',').collect();
        if !fields[0].ends_with("GGA") {
            return Err(NmeaError::Unsupported(fields[0].to_owned()));
        }
        let field = |i: usize, name: &'static str| {
            fields.get(i).copied().ok_or(NmeaError::MissingField(name))
        };

        let latitude = parse_coordinate("latitude", field(2, "latitude")?, field(3, "N/S")?, "S")?;
        let longitude =
            parse_coordinate("longitude", field(4, "longitude")?, field(5, "E/W")?, "W")?;
        let altitude = match field(9, "altitude")? {
            "" => None,
            alt => Some(alt.parse().map_err(|_| NmeaError::BadNumber {
                field: "altitude",
                value: alt.to_owned(),
            })?),
        };

        Ok(Self {
            latitude,
            longitude,
            altitude,
            altitude_units: field(10, "altitude units")?.to_owned(),
            raw: raw.to_owned(),
        })
    }

    /// A receiver without a fix reports zero for latitude or longitude
    pub fn is_valid(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }
}

fn is_gga(line: &str) -> bool {
    line.starts_with('$')
        && line[1..]
            .split(',')
            .next()
            .map_or(false, |kind| kind.ends_with("GGA"))
}

#[derive(Debug, Default)]
struct Latest {
    sentence: Option<String>,
    closed: bool,
}

/// GPS receiver streaming NMEA text, e.g. a serial device or a recorded log.
///
/// A reader thread keeps the most recent GGA sentence around; each query
/// returns it the way a board sensor would (`GPS_GPGGA: $GPGGA,...`).
pub struct NmeaSensor {
    latest: Arc<Mutex<Latest>>,
}

impl NmeaSensor {
    /// Start reading. With `pace`, the reader waits that long after every GGA
    /// sentence, which turns a recorded log into a live-looking feed.
    pub fn spawn<R: BufRead + Send + 'static>(
        mut reader: R,
        pace: Option<Duration>,
    ) -> io::Result<Self> {
        let latest = Arc::new(Mutex::new(Latest::default()));
        let slot = latest.clone();
        thread::Builder::new()
            .name("gps".to_owned())
            .spawn(move || {
                let mut raw = Vec::new();
                loop {
                    raw.clear();
                    match reader.read_until(b'\n', &mut raw) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("GPS read failed - {}", e);
                            break;
                        }
                    }
                    // Undecodable bytes are line noise, keep reading
                    let line = match std::str::from_utf8(&raw) {
                        Ok(line) => line.trim(),
                        Err(_) => {
                            debug!(bytes = raw.len(), "Skipping undecodable GPS line");
                            continue;
                        }
                    };
                    if !is_gga(line) {
                        continue;
                    }
                    debug!(sentence = line, "GGA received");
                    slot.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .sentence = Some(line.to_owned());
                    if let Some(pace) = pace {
                        thread::sleep(pace);
                    }
                }
                info!("GPS stream ended");
                slot.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
            })?;
        Ok(Self { latest })
    }

    pub fn open<P: AsRef<Path>>(path: P, pace: Option<Duration>) -> Result<Self, GpsError> {
        let file = File::open(path)?;
        Ok(Self::spawn(BufReader::new(file), pace)?)
    }
}

impl GpsSensor for NmeaSensor {
    fn read_sensor(&mut self, name: &str) -> Result<String, GpsError> {
        if !name.eq_ignore_ascii_case("gps_gpgga") {
            return Err(GpsError::UnknownSensor(name.to_owned()));
        }
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        if latest.closed {
            return Err(GpsError::Disconnected);
        }
        latest
            .sentence
            .as_ref()
            .map(|s| format!("{}{}", GGA_SENSOR_PREFIX, s))
            .ok_or(GpsError::NoData)
    }
}

/// Stand-in when no GPS is attached, every read comes back empty
#[derive(Debug, Default)]
pub struct NoGps;

impl GpsSensor for NoGps {
    fn read_sensor(&mut self, _name: &str) -> Result<String, GpsError> {
        Err(GpsError::NoData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GGA: &str =
        "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn test_parse_gga() {
        let fix = GpsFix::parse(GGA).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.longitude - 11.516_666).abs() < 1e-4);
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.altitude_units, "M");
        assert_eq!(fix.raw, GGA);
        assert!(fix.is_valid());
    }

    #[test]
    fn test_hemispheres() {
        let body = "GPGGA,000000,3345.000,S,08422.500,W,1,05,1.0,10.0,M,,M,,";
        let sentence = format!("${}*{:02X}", body, nmea_checksum(body));
        let fix = GpsFix::parse(&sentence).unwrap();
        assert!((fix.latitude + 33.75).abs() < 1e-9);
        assert!((fix.longitude + 84.375).abs() < 1e-9);
    }

    #[test]
    fn test_no_fix_is_invalid() {
        let fix = GpsFix::parse("$GPGGA,000000,,,,,0,00,,,M,,M,,").unwrap();
        assert_eq!(fix.latitude, 0.0);
        assert_eq!(fix.altitude, None);
        assert!(!fix.is_valid());
    }

    #[test]
    fn test_rejects_bad_sentences() {
        assert_eq!(GpsFix::parse("GPGGA,1,2"), Err(NmeaError::MissingStart));
        assert!(matches!(
            GpsFix::parse(&GGA.replace("*47", "*48")),
            Err(NmeaError::Checksum { .. })
        ));
        assert!(matches!(
            GpsFix::parse("$GPRMC,123519,A,4807.038,N"),
            Err(NmeaError::Unsupported(_))
        ));
        assert_eq!(
            GpsFix::parse("$GPGGA,123519,4807.038,N"),
            Err(NmeaError::MissingField("longitude"))
        );
    }

    #[test]
    fn test_nmea_sensor_reports_closed_stream() {
        let text = format!("$GPRMC,junk\n{}\n", GGA);
        let mut sensor = NmeaSensor::spawn(Cursor::new(text), None).unwrap();
        // The stream ends right away, after which the sensor reports it closed
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match sensor.read_sensor("gps_gpgga") {
                Err(GpsError::Disconnected) => break,
                _ if std::time::Instant::now() > deadline => panic!("reader never finished"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(matches!(
            sensor.read_sensor("gps_time"),
            Err(GpsError::UnknownSensor(_))
        ));
    }

    #[test]
    fn test_nmea_sensor_survives_line_noise() {
        let mut text = b"\xff\xfe noise\n".to_vec();
        text.extend_from_slice(GGA.as_bytes());
        text.push(b'\n');
        let mut sensor =
            NmeaSensor::spawn(Cursor::new(text), Some(Duration::from_secs(2))).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let reading = loop {
            match sensor.read_sensor("gps_gpgga") {
                Ok(reading) => break reading,
                Err(GpsError::NoData) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("{}", e),
            }
        };
        assert_eq!(reading, format!("{}{}", GGA_SENSOR_PREFIX, GGA));
    }

    #[test]
    fn test_nmea_sensor_prefix() {
        // Paced so the stream is still open when we look
        let text = format!("{}\n", GGA);
        let mut sensor =
            NmeaSensor::spawn(Cursor::new(text), Some(Duration::from_secs(2))).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let reading = loop {
            match sensor.read_sensor("gps_gpgga") {
                Ok(reading) => break reading,
                Err(GpsError::NoData) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("{}", e),
            }
        };
        assert_eq!(reading, format!("{}{}", GGA_SENSOR_PREFIX, GGA));
    }
}
