// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use serde_json::{json, Value};

use crate::celestial_record::{CelestialRecord, EphemerisPoint};
use crate::response_parser::{parse_timestamp, ParseError, ResponseFormat, ResponseParser};

type RecordFn = Box<dyn Fn(&Value) -> CelestialRecord + Send + Sync>;
type EphemerisFn = Box<dyn Fn(&Value) -> EphemerisPoint + Send + Sync>;

/// Decoder for JSON catalog responses. The default extraction walks a
/// configurable dot-path to the records array ("data" by default) and
/// reads the common field-name variants; site-specific extractors
/// (NED, JPL Horizons, Gaia) replace the per-element closure.
pub struct JsonParser {
    records_path: String,
    record_parser: RecordFn,
    ephemeris_parser: EphemerisFn,
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonParser {
    pub fn new() -> Self {
        JsonParser {
            records_path: "data".to_string(),
            record_parser: Box::new(default_record_parser),
            ephemeris_parser: Box::new(default_ephemeris_parser),
        }
    }

    /// Dot-separated path to the records array. "$" means the document
    /// root itself.
    pub fn set_records_path(&mut self, path: &str) {
        self.records_path = path.to_string();
    }

    pub fn set_record_parser(&mut self, parser: RecordFn) {
        self.record_parser = parser;
    }

    pub fn set_ephemeris_parser(&mut self, parser: EphemerisFn) {
        self.ephemeris_parser = parser;
    }

    /// Extractor for NED object responses, which nest coordinates
    /// under Preferred.Coordinates.
    pub fn ned_record_parser() -> RecordFn {
        Box::new(|value: &Value| {
            let mut record = CelestialRecord {
                identifier: get_string(value, "Name"),
                object_type: get_string(value, "Type"),
                brief_description: get_string(value, "Description"),
                ..Default::default()
            };
            if let Some(coords) = value.get("Preferred").and_then(|p| p.get("Coordinates")) {
                if let Some(ra) = get_f64(coords, "RA_deg") {
                    record.ra_deg = ra;
                    record.ra_string = ra.to_string();
                }
                if let Some(dec) = get_f64(coords, "DEC_deg") {
                    record.dec_deg = dec;
                    record.dec_string = dec.to_string();
                }
            }
            // Alternate flat keys used by some NED endpoints.
            if record.ra_deg == 0.0 {
                if let Some(ra) = get_f64(value, "RA") {
                    record.ra_deg = ra;
                    record.ra_string = ra.to_string();
                }
            }
            if record.dec_deg == 0.0 {
                if let Some(dec) = get_f64(value, "DEC") {
                    record.dec_deg = dec;
                    record.dec_string = dec.to_string();
                }
            }
            if let Some(mag) = get_f64(value, "Mag_V") {
                record.visual_magnitude = mag;
            }
            record
        })
    }

    /// Extractor for Gaia DR3 TAP JSON rows. The G-band magnitude
    /// stands in for V; a positive parallax (mas) yields the distance
    /// in parsecs.
    pub fn gaia_record_parser() -> RecordFn {
        Box::new(|value: &Value| {
            let mut record = CelestialRecord {
                identifier: get_string(value, "source_id"),
                ..Default::default()
            };
            if let Some(ra) = get_f64(value, "ra") {
                record.ra_deg = ra;
                record.ra_string = ra.to_string();
            }
            if let Some(dec) = get_f64(value, "dec") {
                record.dec_deg = dec;
                record.dec_string = dec.to_string();
            }
            if let Some(mag) = get_f64(value, "phot_g_mean_mag") {
                record.visual_magnitude = mag;
            }
            if let Some(mag) = get_f64(value, "phot_bp_mean_mag") {
                record.photographic_magnitude = mag;
            }
            if let Some(parallax_mas) = get_f64(value, "parallax") {
                if parallax_mas > 0.0 {
                    record.distance_parsecs = 1000.0 / parallax_mas;
                }
            }
            record
        })
    }

    /// Extractor for JPL Horizons observer-table lines once they have
    /// been decoded to JSON objects.
    pub fn jpl_horizons_ephemeris_parser() -> EphemerisFn {
        Box::new(|value: &Value| {
            let mut point = EphemerisPoint::default();
            if let Some(time) = parse_timestamp(&get_string(value, "datetime")) {
                point.time = time;
            }
            if let Some(ra) = get_f64(value, "RA") {
                point.ra_deg = ra;
            }
            if let Some(dec) = get_f64(value, "DEC") {
                point.dec_deg = dec;
            }
            if let Some(delta) = get_f64(value, "delta") {
                point.distance_au = delta;
            }
            if let Some(mag) = get_f64(value, "mag") {
                point.magnitude = mag;
            }
            if let Some(elong) = get_f64(value, "elong") {
                point.elongation_deg = elong;
            }
            if let Some(phase) = get_f64(value, "phase") {
                point.phase_angle_deg = phase;
            }
            point
        })
    }

    /// Serializes records in the shape the default extraction reads,
    /// under a top-level "data" array.
    pub fn serialize_records(records: &[CelestialRecord]) -> String {
        let array: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "name": record.identifier,
                    "ra": record.ra_deg,
                    "dec": record.dec_deg,
                    "mag": record.visual_magnitude,
                    "type": record.object_type,
                    "constellation": record.constellation_en,
                    "major_axis": record.major_axis_arcmin,
                    "minor_axis": record.minor_axis_arcmin,
                    "position_angle": record.position_angle_deg,
                    "description": record.brief_description,
                })
            })
            .collect();
        json!({ "data": array }).to_string()
    }

    fn document(&self, content: &str) -> Result<Value, ParseError> {
        serde_json::from_str::<Value>(content).map_err(|e| {
            ParseError::new(&format!("JSON parse error: {}", e), "invalid JSON")
                .at_line_column(e.line(), e.column())
        })
    }
}

fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = current.get(segment)?;
    }
    Some(current)
}

/// Numeric field that may arrive as a JSON number or a numeric string.
fn get_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// String field that may arrive as a JSON string or a number.
fn get_string(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn default_record_parser(value: &Value) -> CelestialRecord {
    let mut record = CelestialRecord::default();

    for key in ["name", "id", "source_id"] {
        let identifier = get_string(value, key);
        if !identifier.is_empty() {
            record.identifier = identifier;
            break;
        }
    }

    if let Some(ra) = get_f64(value, "ra") {
        record.ra_deg = ra;
        record.ra_string = ra.to_string();
    }
    if let Some(dec) = get_f64(value, "dec") {
        record.dec_deg = dec;
        record.dec_string = dec.to_string();
    }
    for key in ["mag", "magnitude", "V"] {
        if let Some(mag) = get_f64(value, key) {
            record.visual_magnitude = mag;
            break;
        }
    }
    for key in ["type", "otype", "morphology"] {
        let object_type = get_string(value, key);
        if !object_type.is_empty() {
            record.object_type = object_type;
            break;
        }
    }
    for key in ["constellation", "const"] {
        let constellation = get_string(value, key);
        if !constellation.is_empty() {
            record.constellation_en = constellation;
            break;
        }
    }
    if let Some(major) = get_f64(value, "major_axis") {
        record.major_axis_arcmin = major;
    }
    if let Some(minor) = get_f64(value, "minor_axis") {
        record.minor_axis_arcmin = minor;
    }
    if let Some(pa) = get_f64(value, "position_angle") {
        record.position_angle_deg = pa;
    }
    record.brief_description = get_string(value, "description");

    record
}

fn default_ephemeris_parser(value: &Value) -> EphemerisPoint {
    let mut point = EphemerisPoint::default();
    if let Some(time) = parse_timestamp(&get_string(value, "timestamp")) {
        point.time = time;
    }
    if let Some(ra) = get_f64(value, "ra") {
        point.ra_deg = ra;
    }
    if let Some(dec) = get_f64(value, "dec") {
        point.dec_deg = dec;
    }
    for key in ["distance", "delta"] {
        if let Some(distance) = get_f64(value, key) {
            point.distance_au = distance;
            break;
        }
    }
    for key in ["magnitude", "mag"] {
        if let Some(mag) = get_f64(value, key) {
            point.magnitude = mag;
            break;
        }
    }
    if let Some(elong) = get_f64(value, "elongation") {
        point.elongation_deg = elong;
    }
    if let Some(phase) = get_f64(value, "phase_angle") {
        point.phase_angle_deg = phase;
    }
    if let Some(az) = get_f64(value, "azimuth") {
        point.azimuth_deg = az;
    }
    if let Some(alt) = get_f64(value, "altitude") {
        point.altitude_deg = alt;
    }
    point
}

impl ResponseParser for JsonParser {
    fn parse(&self, content: &str) -> Result<Vec<CelestialRecord>, ParseError> {
        let document = self.document(content)?;

        let selected = if self.records_path == "$" {
            Some(&document)
        } else {
            value_at_path(&document, &self.records_path)
        };

        let mut records = vec![];
        let mut push = |value: &Value| {
            let record = (self.record_parser)(value);
            if !record.identifier.is_empty() {
                records.push(record);
            }
        };

        match selected {
            Some(Value::Array(items)) => items.iter().for_each(&mut push),
            Some(value @ Value::Object(_)) => push(value),
            _ => match &document {
                // Path not found: fall back to the document itself.
                Value::Array(items) => items.iter().for_each(&mut push),
                Value::Object(_) => push(&document),
                _ => {
                    return Err(ParseError::new(
                        "JSON is neither array nor object",
                        "unexpected JSON structure",
                    ));
                }
            },
        }

        Ok(records)
    }

    fn parse_ephemeris(&self, content: &str) -> Result<Vec<EphemerisPoint>, ParseError> {
        let document = self.document(content)?;

        let selected = ["result", "data"]
            .iter()
            .find_map(|key| document.get(*key).filter(|v| v.is_array()))
            .unwrap_or(&document);

        let mut points = vec![];
        match selected {
            Value::Array(items) => {
                for item in items {
                    points.push((self.ephemeris_parser)(item));
                }
            }
            Value::Object(_) => points.push((self.ephemeris_parser)(selected)),
            _ => {
                return Err(ParseError::new(
                    "Ephemeris data not found in expected format",
                    "unable to locate ephemeris array",
                ));
            }
        }
        Ok(points)
    }

    fn format(&self) -> ResponseFormat {
        ResponseFormat::Json
    }
}

// mod tests.
