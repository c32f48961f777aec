// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::celestial_record::{CelestialRecord, EphemerisPoint};

/// The query modes offered across the catalog services. Each provider
/// advertises the subset it supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Search by object name or identifier.
    ByName,
    /// Cone search around an RA/Dec position.
    ByCoordinates,
    /// Search within a constellation.
    ByConstellation,
    /// Solar system ephemeris (JPL Horizons).
    Ephemeris,
    /// Catalog-specific lookup (e.g. a VizieR table).
    Catalog,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::ByName => "by_name",
            QueryKind::ByCoordinates => "by_coord",
            QueryKind::ByConstellation => "by_constellation",
            QueryKind::Ephemeris => "ephemeris",
            QueryKind::Catalog => "by_catalog",
        }
    }
}

/// Observer location for topocentric ephemeris calculations.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ObserverLocation {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub elevation_m: f64,
}

/// Parameters for a catalog query. Which fields must be present is
/// determined by `kind`; see the provider implementations.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    pub kind: QueryKind,

    /// Search term or object name.
    pub term: String,

    // Cone search parameters, degrees.
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub radius_deg: Option<f64>,

    /// Specific catalog to query, for `Catalog` kind.
    pub catalog: Option<String>,

    pub min_magnitude: Option<f64>,
    pub max_magnitude: Option<f64>,

    pub object_type: Option<String>,

    /// Maximum results to return.
    pub limit: usize,

    /// Epoch for ephemeris queries.
    pub epoch: DateTime<Utc>,

    pub observer: Option<ObserverLocation>,
}

impl Default for QueryRequest {
    fn default() -> Self {
        QueryRequest {
            kind: QueryKind::ByName,
            term: String::new(),
            ra_deg: None,
            dec_deg: None,
            radius_deg: None,
            catalog: None,
            min_magnitude: None,
            max_magnitude: None,
            object_type: None,
            limit: 100,
            epoch: Utc::now(),
            observer: None,
        }
    }
}

impl QueryRequest {
    pub fn by_name(term: &str) -> Self {
        QueryRequest {
            term: term.to_string(),
            ..Default::default()
        }
    }

    pub fn cone_search(ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Self {
        QueryRequest {
            kind: QueryKind::ByCoordinates,
            ra_deg: Some(ra_deg),
            dec_deg: Some(dec_deg),
            radius_deg: Some(radius_deg),
            ..Default::default()
        }
    }

    pub fn ephemeris(target: &str, epoch: DateTime<Utc>) -> Self {
        QueryRequest {
            kind: QueryKind::Ephemeris,
            term: target.to_string(),
            epoch,
            ..Default::default()
        }
    }

    pub fn catalog(catalog: &str) -> Self {
        QueryRequest {
            kind: QueryKind::Catalog,
            catalog: Some(catalog.to_string()),
            ..Default::default()
        }
    }
}

/// The result of a provider query: catalog records and/or an ephemeris
/// series, plus provenance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub records: Vec<CelestialRecord>,

    /// Populated for ephemeris queries.
    pub ephemeris: Vec<EphemerisPoint>,

    pub provider: String,

    pub query_time: Duration,

    pub from_cache: bool,

    /// Total matches available at the service, which may exceed the
    /// number returned.
    pub total_available: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryErrorCode {
    NetworkError,
    Timeout,
    RateLimited,
    ParseError,
    InvalidQuery,
    ServiceUnavailable,
    AuthenticationFailed,
    NotFound,
    Unknown,
}

/// A typed failure from a provider or the search service. Retryable
/// errors may be reissued against the same provider; the service falls
/// over to the next provider in priority order for the rest.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryError {
    pub code: QueryErrorCode,
    pub message: String,
    pub provider: String,

    /// Present for rate limit errors: how long to wait before retrying.
    pub retry_after: Option<Duration>,

    /// Response body excerpt for diagnostics, when available.
    pub raw_response: Option<String>,
}

impl QueryError {
    pub fn new(code: QueryErrorCode, provider: &str, message: &str) -> Self {
        QueryError {
            code,
            message: message.to_string(),
            provider: provider.to_string(),
            retry_after: None,
            raw_response: None,
        }
    }

    pub fn rate_limited(provider: &str, retry_after: Duration) -> Self {
        QueryError {
            code: QueryErrorCode::RateLimited,
            message: format!("rate limited, retry after {:?}", retry_after),
            provider: provider.to_string(),
            retry_after: Some(retry_after),
            raw_response: None,
        }
    }

    pub fn with_raw_response(mut self, raw: &str) -> Self {
        // Bound the retained body; error values travel far.
        const MAX_RAW: usize = 500;
        let mut excerpt = raw.to_string();
        if excerpt.len() > MAX_RAW {
            let mut cut = MAX_RAW;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
        }
        self.raw_response = Some(excerpt);
        self
    }

    /// True for transient conditions worth retrying: network faults,
    /// timeouts, rate limits and 5xx-class unavailability. Parse and
    /// query-validation failures are caller bugs and are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            QueryErrorCode::NetworkError
                | QueryErrorCode::Timeout
                | QueryErrorCode::RateLimited
                | QueryErrorCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {:?}: {}", self.provider, self.code, self.message)
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        let provider = "SIMBAD";
        for code in [
            QueryErrorCode::NetworkError,
            QueryErrorCode::Timeout,
            QueryErrorCode::RateLimited,
            QueryErrorCode::ServiceUnavailable,
        ] {
            assert!(QueryError::new(code, provider, "x").is_retryable());
        }
        for code in [
            QueryErrorCode::ParseError,
            QueryErrorCode::InvalidQuery,
            QueryErrorCode::AuthenticationFailed,
            QueryErrorCode::NotFound,
            QueryErrorCode::Unknown,
        ] {
            assert!(!QueryError::new(code, provider, "x").is_retryable());
        }
    }

    #[test]
    fn test_raw_response_is_truncated() {
        let long_body = "x".repeat(2000);
        let err = QueryError::new(QueryErrorCode::ParseError, "NED", "bad")
            .with_raw_response(&long_body);
        assert_eq!(err.raw_response.unwrap().len(), 500);
    }

    #[test]
    fn test_request_constructors() {
        let req = QueryRequest::cone_search(10.6847, 41.2689, 0.5);
        assert_eq!(req.kind, QueryKind::ByCoordinates);
        assert_eq!(req.radius_deg, Some(0.5));
        assert_eq!(req.limit, 100);

        let req = QueryRequest::by_name("M31");
        assert_eq!(req.kind, QueryKind::ByName);
        assert_eq!(req.term, "M31");
    }

}  // mod tests.
