// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use chrono::{DateTime, Utc};

use crate::coords::CelestialCoord;

/// A catalog object as reported by one or more catalog services. Built
/// by a response parser and then immutable: it flows through the cache
/// and the merger by value.
///
/// Numeric fields use 0 to mean "not reported"; string fields use the
/// empty string. Only `identifier` is required to be non-empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CelestialRecord {
    /// Primary catalog identifier, e.g. "NGC0224" or "M31".
    pub identifier: String,

    /// Messier designation without prefix, e.g. "31".
    pub m_identifier: String,

    /// NGC and IC cross references without prefix.
    pub ngc_identifier: String,
    pub ic_identifier: String,

    /// Comma-separated alternative designations.
    pub aliases: String,

    // Position, J2000. The string forms carry whatever the service
    // reported; the decimal forms are always degrees.
    pub ra_string: String,
    pub ra_deg: f64,
    pub dec_string: String,
    pub dec_deg: f64,

    /// Object type, e.g. "G" or "Galaxy".
    pub object_type: String,

    /// Morphological classification (Hubble type for galaxies).
    pub morphology: String,

    pub constellation_en: String,
    pub constellation_zh: String,

    pub visual_magnitude: f64,
    pub photographic_magnitude: f64,
    pub b_minus_v: f64,

    /// Mean surface brightness in mag/arcmin^2.
    pub surface_brightness: f64,

    pub major_axis_arcmin: f64,
    pub minor_axis_arcmin: f64,
    pub position_angle_deg: f64,

    /// Distance in parsecs, when the service reports a usable
    /// parallax. 0 when unknown.
    pub distance_parsecs: f64,

    pub detailed_description: String,
    pub brief_description: String,
}

impl CelestialRecord {
    pub fn coordinates(&self) -> CelestialCoord {
        CelestialCoord {
            ra: self.ra_deg,
            dec: self.dec_deg,
            ra_string: self.ra_string.clone(),
            dec_string: self.dec_string.clone(),
        }
    }

    /// True when the object's declination can rise above the horizon
    /// for an observer at `latitude_deg`.
    pub fn is_visible_from(&self, latitude_deg: f64) -> bool {
        self.dec_deg >= latitude_deg - 90.0 && self.dec_deg <= latitude_deg + 90.0
    }

    /// Counts populated fields: non-empty strings and non-zero
    /// numerics. Used by the merger to pick the more complete of two
    /// duplicate records.
    pub fn non_empty_field_count(&self) -> usize {
        let strings = [
            &self.identifier,
            &self.m_identifier,
            &self.ngc_identifier,
            &self.ic_identifier,
            &self.aliases,
            &self.ra_string,
            &self.dec_string,
            &self.object_type,
            &self.morphology,
            &self.constellation_en,
            &self.constellation_zh,
            &self.detailed_description,
            &self.brief_description,
        ];
        let numbers = [
            self.ra_deg,
            self.dec_deg,
            self.visual_magnitude,
            self.photographic_magnitude,
            self.b_minus_v,
            self.surface_brightness,
            self.major_axis_arcmin,
            self.minor_axis_arcmin,
            self.position_angle_deg,
            self.distance_parsecs,
        ];

        strings.iter().filter(|s| !s.is_empty()).count()
            + numbers.iter().filter(|n| **n != 0.0).count()
    }
}

/// A single time-indexed position of a solar system body, as produced
/// by an ephemeris service. Azimuth/altitude are populated only when
/// the request carried an observer location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EphemerisPoint {
    pub time: DateTime<Utc>,

    pub ra_deg: f64,
    pub dec_deg: f64,

    /// Geocentric (or topocentric, with an observer) distance in AU.
    pub distance_au: f64,

    pub magnitude: f64,

    /// Solar elongation in degrees.
    pub elongation_deg: f64,

    pub phase_angle_deg: f64,

    pub azimuth_deg: f64,
    pub altitude_deg: f64,
}

// mod tests.
