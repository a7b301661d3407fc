//! Offline survey mapping: turn a telemetry log into a colour-coded map page

use std::{
    fmt::Write as _,
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::gps::GpsFix;

#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("survey I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no record in the log has a valid GPS fix, nothing to map")]
    NoValidRecords,
}

/// One located RSSI measurement
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub rssi: f64,
    pub altitude: Option<f64>,
    pub altitude_units: String,
}

impl SurveyPoint {
    pub fn label(&self) -> String {
        match self.altitude {
            Some(alt) => format!("{:.1} dBm, {:.1}{}", self.rssi, alt, self.altitude_units),
            None => format!("{:.1} dBm, no altitude", self.rssi),
        }
    }
}

/// How many lines of a log made it onto the map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    /// Lines starting with `$`
    pub sentences: usize,
    pub valid: usize,
}

/// A log line is `<GGA sentence> <rssi>`. Anything else, or a fix without a
/// position, yields `None`.
pub fn parse_line(line: &str) -> Option<SurveyPoint> {
    let line = line.trim();
    if !line.starts_with('$') {
        return None;
    }
    let mut tokens = line.split_whitespace();
    let sentence = tokens.next()?;
    let rssi: f64 = match tokens.next().map(str::parse) {
        Some(Ok(rssi)) => rssi,
        _ => {
            debug!(line, "Skipping record without RSSI");
            return None;
        }
    };
    let fix = match GpsFix::parse(sentence) {
        Ok(fix) => fix,
        Err(e) => {
            debug!(line, "Skipping record - {}", e);
            return None;
        }
    };
    if !fix.is_valid() {
        debug!(line, "Skipping record without a position fix");
        return None;
    }
    Some(SurveyPoint {
        latitude: fix.latitude,
        longitude: fix.longitude,
        rssi,
        altitude: fix.altitude,
        altitude_units: fix.altitude_units,
    })
}

pub fn parse_log<R: BufRead>(mut reader: R) -> Result<(Vec<SurveyPoint>, ParseStats), SurveyError> {
    let mut stats = ParseStats::default();
    let mut points = Vec::new();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        stats.lines += 1;
        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(_) => {
                debug!(line = stats.lines, "Skipping undecodable line");
                continue;
            }
        };
        if line.trim_start().starts_with('$') {
            stats.sentences += 1;
        }
        if let Some(point) = parse_line(&line) {
            points.push(point);
        }
    }
    stats.valid = points.len();
    Ok((points, stats))
}

type Segments = &'static [(f64, f64)];

const JET_RED: Segments = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: Segments = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: Segments = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

fn interpolate(segments: Segments, t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    for pair in segments.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if t <= x1 {
            return y0 + (y1 - y0) * (t - x0) / (x1 - x0);
        }
    }
    segments[segments.len() - 1].1
}

/// The "jet" colormap: dark blue at 0 through cyan, yellow and red to dark red at 1
pub fn jet(t: f64) -> [f64; 3] {
    [
        interpolate(JET_RED, t),
        interpolate(JET_GREEN, t),
        interpolate(JET_BLUE, t),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Channels in [0, 1], truncated to 8 bits
    pub fn from_unit(c: [f64; 3]) -> Self {
        let q = |v: f64| (v.clamp(0.0, 1.0) * 255.0) as u8;
        Self(q(c[0]), q(c[1]), q(c[2]))
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// A marker ready to be placed on the map
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub latitude: f64,
    pub longitude: f64,
    pub color: Rgb,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct SurveyMap {
    points: Vec<SurveyPoint>,
    rssi_min: f64,
    rssi_max: f64,
}

impl SurveyMap {
    pub fn from_points(points: Vec<SurveyPoint>) -> Result<Self, SurveyError> {
        if points.is_empty() {
            return Err(SurveyError::NoValidRecords);
        }
        let (rssi_min, rssi_max) = points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.rssi), hi.max(p.rssi))
            });
        Ok(Self {
            points,
            rssi_min,
            rssi_max,
        })
    }

    pub fn points(&self) -> &[SurveyPoint] {
        &self.points
    }

    pub fn rssi_min(&self) -> f64 {
        self.rssi_min
    }

    pub fn rssi_max(&self) -> f64 {
        self.rssi_max
    }

    /// Position of `rssi` within the observed range, 0 when every point is equal
    pub fn normalize(&self, rssi: f64) -> f64 {
        let span = self.rssi_max - self.rssi_min;
        if span <= 0.0 {
            return 0.0;
        }
        ((rssi - self.rssi_min) / span).clamp(0.0, 1.0)
    }

    pub fn color(&self, rssi: f64) -> Rgb {
        Rgb::from_unit(jet(self.normalize(rssi)))
    }

    pub fn markers(&self) -> impl Iterator<Item = Marker> + '_ {
        self.points.iter().map(move |p| Marker {
            latitude: p.latitude,
            longitude: p.longitude,
            color: self.color(p.rssi),
            label: p.label(),
        })
    }

    /// A standalone Leaflet page centred on the first point
    pub fn render_html(&self) -> String {
        let center = &self.points[0];
        let mut html = String::new();
        html.push_str(PAGE_HEAD);
        // Writing into a String cannot fail
        let _ = writeln!(
            html,
            "var map = L.map('map').setView([{:.6}, {:.6}], {});",
            center.latitude, center.longitude, MAP_ZOOM
        );
        html.push_str(TILE_LAYER);
        html.push_str("var points = [\n");
        for m in self.markers() {
            let _ = writeln!(
                html,
                "  [{:.6}, {:.6}, \"{}\", {}],",
                m.latitude,
                m.longitude,
                m.color.hex(),
                js_string(&m.label)
            );
        }
        html.push_str("];\n");
        html.push_str(PAGE_TAIL);
        html
    }

    pub fn write_html(&self, path: &Path) -> Result<(), SurveyError> {
        fs::write(path, self.render_html())?;
        info!(path = %path.display(), markers = self.points.len(), "Survey map written");
        Ok(())
    }
}

/// The map goes next to the log, same name with an `.html` extension
pub fn output_path(log: &Path) -> PathBuf {
    log.with_extension("html")
}

const MAP_ZOOM: u32 = 16;

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>RSSI survey</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>html, body, #map { height: 100%; margin: 0; }</style>
</head>
<body>
<div id="map"></div>
<script>
"#;

const TILE_LAYER: &str = r#"L.tileLayer('https://tile.openstreetmap.org/{z}/{x}/{y}.png', {
  maxZoom: 19,
  attribution: '&copy; OpenStreetMap contributors'
}).addTo(map);
"#;

const PAGE_TAIL: &str = r#"points.forEach(function (p) {
  L.circleMarker([p[0], p[1]], {
    radius: 6, weight: 1, color: p[2], fillColor: p[2], fillOpacity: 0.9
  }).bindTooltip(p[3]).addTo(map);
});
</script>
</body>
</html>
"#;

/// Quote `s` as a JavaScript string literal that is also safe inside `<script>`
fn js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::nmea_checksum;
    use std::io::Cursor;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn gga(lat: &str, lon: &str, alt: &str) -> String {
        let body = format!("GPGGA,120000,{},N,{},E,1,08,0.9,{},M,46.9,M,,", lat, lon, alt);
        format!("${}*{:02X}", body, nmea_checksum(&body))
    }

    /// Hue in degrees of an RGB triple with channels in [0, 1]
    fn hue(c: [f64; 3]) -> f64 {
        let [r, g, b] = c;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let d = max - min;
        if d == 0.0 {
            return 240.0;
        }
        let h = if max == r {
            60.0 * (((g - b) / d) % 6.0)
        } else if max == g {
            60.0 * ((b - r) / d + 2.0)
        } else {
            60.0 * ((r - g) / d + 4.0)
        };
        if h < 0.0 {
            h + 360.0
        } else {
            h
        }
    }

    #[test]
    fn test_record_round_trip() {
        let line = format!("{} -62.4", GGA);
        let p = parse_line(&line).unwrap();
        assert!((p.latitude - 48.1173).abs() < 1e-4);
        assert!((p.longitude - 11.516_666).abs() < 1e-4);
        assert_eq!(p.rssi, -62.4);
        assert_eq!(p.altitude, Some(545.4));
        assert_eq!(p.label(), "-62.4 dBm, 545.4M");
    }

    #[test]
    fn test_counts_only_valid_records() {
        let log = [
            "#gps_message RSSI(dBm)".to_owned(),
            "#gps_unavailable -70.1".to_owned(),
            format!("{} -60.0", gga("4807.038", "01131.000", "500.0")),
            format!("{} -65.5", gga("4807.100", "01131.050", "501.0")),
            // No fix
            "$GPGGA,000000,,,,,0,00,,,M,,M,, -70.0".to_owned(),
            // Checksum mismatch
            format!("{} -61.0", GGA.replace("*47", "*00")),
            // RSSI missing
            gga("4807.200", "01131.100", "502.0"),
            "$GARBAGE -50.0".to_owned(),
            String::new(),
            format!("{} -72.3", gga("4807.300", "01131.150", "")),
        ]
        .join("\n");
        let (points, stats) = parse_log(Cursor::new(log)).unwrap();
        assert_eq!(
            stats,
            ParseStats {
                lines: 10,
                sentences: 7,
                valid: 3
            }
        );
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].label(), "-60.0 dBm, 500.0M");
        assert_eq!(points[2].altitude, None);
        assert_eq!(points[2].label(), "-72.3 dBm, no altitude");

        let map = SurveyMap::from_points(points).unwrap();
        assert_eq!(map.rssi_max(), -60.0);
        assert_eq!(map.rssi_min(), -72.3);
    }

    #[test]
    fn test_undecodable_line_is_skipped() {
        let mut log = format!("{} -60.0\n", gga("4807.038", "01131.000", "500.0")).into_bytes();
        log.extend_from_slice(b"\xc3garbage\n");
        log.extend_from_slice(format!("{} -65.0\n", gga("4807.100", "01131.050", "501.0")).as_bytes());
        let (points, stats) = parse_log(Cursor::new(log)).unwrap();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.valid, 2);
        assert_eq!(points[1].rssi, -65.0);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(Rgb::from_unit(jet(0.0)).hex(), "#00007f");
        assert_eq!(Rgb::from_unit(jet(1.0)).hex(), "#7f0000");
        assert_eq!(Rgb::from_unit(jet(0.5)).hex().len(), 7);
    }

    #[test]
    fn test_colour_moves_from_blue_to_red() {
        let mut last = hue(jet(0.0));
        for i in 1..=200 {
            let h = hue(jet(i as f64 / 200.0));
            assert!(h <= last + 1e-9, "hue went up at step {}: {} > {}", i, h, last);
            last = h;
        }

        let point = |rssi| SurveyPoint {
            latitude: 1.0,
            longitude: 1.0,
            rssi,
            altitude: None,
            altitude_units: String::new(),
        };
        let map = SurveyMap::from_points(vec![point(-90.0), point(-75.0), point(-60.0)]).unwrap();
        let colors: Vec<Rgb> = map.markers().map(|m| m.color).collect();
        assert_eq!(colors[0], Rgb::from_unit(jet(0.0)));
        assert_eq!(colors[2], Rgb::from_unit(jet(1.0)));
        assert_ne!(colors[1], colors[0]);
        assert_ne!(colors[1], colors[2]);
    }

    #[test]
    fn test_flat_survey_is_blue() {
        let p = parse_line(&format!("{} -60.0", GGA)).unwrap();
        let map = SurveyMap::from_points(vec![p.clone(), p]).unwrap();
        assert_eq!(map.normalize(-60.0), 0.0);
        assert_eq!(map.color(-60.0), Rgb::from_unit(jet(0.0)));
    }

    #[test]
    fn test_empty_log_is_an_error() {
        let (points, stats) =
            parse_log(Cursor::new("#gps_message RSSI(dBm)\n#gps_unavailable -80.0\n")).unwrap();
        assert_eq!(stats.valid, 0);
        assert!(matches!(
            SurveyMap::from_points(points),
            Err(SurveyError::NoValidRecords)
        ));
    }

    #[test]
    fn test_render_html() {
        let p = parse_line(&format!("{} -62.4", GGA)).unwrap();
        let map = SurveyMap::from_points(vec![p]).unwrap();
        let html = map.render_html();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("setView([48.117300, 11.516667], 16);"));
        assert!(html.contains("  [48.117300, 11.516667, \""));
        assert!(html.contains("], 16);"));
        assert!(html.contains("\"-62.4 dBm, 545.4M\""));
        assert!(html.contains(&map.color(-62.4).hex()));
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("logs/log_98900000_1407369600.txt")),
            PathBuf::from("logs/log_98900000_1407369600.html")
        );
    }

    #[test]
    fn test_js_string_escapes_markup() {
        assert_eq!(js_string("a\"b</script>"), r#""a\"b\u003c/script\u003e""#);
    }
}
