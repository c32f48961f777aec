// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use serde::{Deserialize, Serialize};

/// A point on the celestial sphere in the J2000.0 equatorial frame.
/// `ra` is right ascension in decimal degrees [0, 360); `dec` is
/// declination in decimal degrees [-90, +90]. The string forms are
/// sexagesimal renderings kept alongside the decimal values because
/// several catalog services report coordinates only as strings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CelestialCoord {
    pub ra: f64,
    pub dec: f64,

    pub ra_string: String,
    pub dec_string: String,
}

impl CelestialCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        CelestialCoord {
            ra,
            dec,
            ra_string: format_ra_hms(ra),
            dec_string: format_dec_dms(dec),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.ra >= 0.0 && self.ra < 360.0 && self.dec >= -90.0 && self.dec <= 90.0
    }

    /// Angular distance to `other` in degrees, haversine form.
    pub fn angular_distance(&self, other: &CelestialCoord) -> f64 {
        angular_separation_deg(self.ra, self.dec, other.ra, other.dec)
    }
}

/// Returns the separation in degrees between two positions given in
/// degrees. Haversine form; exact at 0 and at the antipode.
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let ra1_rad = ra1.to_radians();
    let dec1_rad = dec1.to_radians();
    let ra2_rad = ra2.to_radians();
    let dec2_rad = dec2.to_radians();

    let d_ra = ra2_rad - ra1_rad;
    let d_dec = dec2_rad - dec1_rad;

    let a = (d_dec / 2.0).sin() * (d_dec / 2.0).sin()
        + dec1_rad.cos() * dec2_rad.cos() * (d_ra / 2.0).sin() * (d_ra / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    c.to_degrees()
}

/// Parses "D:M:S.sss" (optionally signed) into a plain decimal value.
/// One, two, or three colon-separated parts are accepted. No unit
/// conversion is applied; the caller decides whether the leading part
/// is hours or degrees.
pub fn parse_sexagesimal(s: &str) -> Option<f64> {
    let trimmed: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.is_empty() {
        return None;
    }

    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, trimmed.strip_prefix('+').unwrap_or(&trimmed)),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut value = 0.0;
    let mut scale = 1.0;
    for part in &parts {
        value += part.parse::<f64>().ok()? / scale;
        scale *= 60.0;
    }

    Some(if negative { -value } else { value })
}

/// Parses a coordinate field that may be decimal degrees or
/// sexagesimal. Decimal wins when the string parses as a bare float.
pub fn parse_coordinate(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    parse_sexagesimal(trimmed)
}

/// Parses an "HH:MM:SS.S" right ascension into degrees (hours x 15).
pub fn parse_ra_hours(s: &str) -> Option<f64> {
    parse_sexagesimal(s).map(|hours| hours * 15.0)
}

/// Parses a "+DD:MM:SS.S" declination into degrees.
pub fn parse_dec_degrees(s: &str) -> Option<f64> {
    parse_sexagesimal(s)
}

pub fn format_ra_hms(ra_deg: f64) -> String {
    let total_hours = (ra_deg.rem_euclid(360.0)) / 15.0;
    let hours = total_hours.floor();
    let minutes = ((total_hours - hours) * 60.0).floor();
    let seconds = (total_hours - hours - minutes / 60.0) * 3600.0;
    format!("{:02}:{:02}:{:05.2}", hours as u32, minutes as u32, seconds)
}

pub fn format_dec_dms(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let abs = dec_deg.abs();
    let degrees = abs.floor();
    let minutes = ((abs - degrees) * 60.0).floor();
    let seconds = (abs - degrees - minutes / 60.0) * 3600.0;
    format!("{}{:02}:{:02}:{:04.1}", sign, degrees as u32, minutes as u32, seconds)
}

// mod tests.
