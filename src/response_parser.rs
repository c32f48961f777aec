// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::celestial_record::{CelestialRecord, EphemerisPoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    /// IVOA VOTable XML.
    VoTable,
    Json,
    Csv,
    Tsv,
    Unknown,
}

/// A malformed-body failure. Not retryable; carries enough location
/// information to point at the offending input.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub byte: Option<usize>,
    pub context: String,
}

impl ParseError {
    pub fn new(message: &str, context: &str) -> Self {
        ParseError {
            message: message.to_string(),
            context: context.to_string(),
            ..Default::default()
        }
    }

    pub fn at_byte(mut self, byte: usize) -> Self {
        self.byte = Some(byte);
        self
    }

    pub fn at_line_column(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " at line {} column {}", line, column)?;
        } else if let Some(byte) = self.byte {
            write!(f, " at byte {}", byte)?;
        }
        if !self.context.is_empty() {
            write!(f, " ({})", self.context)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Shared shape of the VOTable and JSON response decoders.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, content: &str) -> Result<Vec<CelestialRecord>, ParseError>;

    fn parse_ephemeris(&self, content: &str) -> Result<Vec<EphemerisPoint>, ParseError>;

    fn format(&self) -> ResponseFormat;
}

/// Best-effort sniffing of a response body's format.
pub fn detect_format(content: &str) -> ResponseFormat {
    let trimmed = content.trim_start();
    if trimmed.starts_with('<') {
        if trimmed.contains("VOTABLE") {
            return ResponseFormat::VoTable;
        }
        return ResponseFormat::Unknown;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return ResponseFormat::Json;
    }
    if let Some(first_line) = trimmed.lines().next() {
        if first_line.contains(';') || first_line.contains(',') {
            return ResponseFormat::Csv;
        }
        if first_line.contains('\t') {
            return ResponseFormat::Tsv;
        }
    }
    ResponseFormat::Unknown
}

/// Parses the timestamp shapes the catalog services emit: RFC 3339,
/// "YYYY-MM-DDTHH:MM:SS", "YYYY-MM-DD HH:MM:SS", or a bare date.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Parses a magnitude that may carry a trailing band letter, e.g.
/// "12.34V". Non-numeric suffix characters are stripped before
/// conversion.
pub fn parse_magnitude(s: &str) -> Option<f64> {
    let mut trimmed = s.trim();
    while let Some(last) = trimmed.chars().last() {
        if last.is_alphabetic() {
            trimmed = &trimmed[..trimmed.len() - last.len_utf8()];
        } else {
            break;
        }
    }
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

// mod tests.
