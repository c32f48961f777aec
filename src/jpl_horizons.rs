// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::celestial_record::{CelestialRecord, EphemerisPoint};
use crate::http_client::HttpRequest;
use crate::json_parser::JsonParser;
use crate::provider::{CatalogProvider, ProviderShared};
use crate::response_parser::ResponseParser;
use crate::query::{
    ObserverLocation, QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult,
};

const PROVIDER_NAME: &str = "JPL_Horizons";
const BASE_URL: &str = "https://ssd.jpl.nasa.gov/api/horizons.api";

/// Horizons target designators for the major solar system bodies.
/// Planet barycenters are avoided; these are the body centers.
const TARGET_DESIGNATORS: [(&str, &str); 10] = [
    ("sun", "10"),
    ("mercury", "199"),
    ("venus", "299"),
    ("moon", "301"),
    ("mars", "499"),
    ("jupiter", "599"),
    ("saturn", "699"),
    ("uranus", "799"),
    ("neptune", "899"),
    ("pluto", "999"),
];

#[derive(Clone, Debug)]
pub struct JplHorizonsConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub use_cache: bool,

    /// Step between ephemeris samples for series queries.
    pub step_minutes: u32,
}

impl Default for JplHorizonsConfig {
    fn default() -> Self {
        JplHorizonsConfig {
            base_url: BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            use_cache: true,
            step_minutes: 60,
        }
    }
}

/// Adapter for the JPL Horizons ephemeris service. Issues observer
/// table requests and decodes the `$$SOE`/`$$EOE`-delimited lines
/// embedded in the JSON `result` string.
pub struct JplHorizonsProvider {
    shared: ProviderShared,
    config: JplHorizonsConfig,
    parser: JsonParser,
}

impl JplHorizonsProvider {
    pub fn new(shared: ProviderShared, config: JplHorizonsConfig) -> Self {
        let mut parser = JsonParser::new();
        parser.set_ephemeris_parser(JsonParser::jpl_horizons_ephemeris_parser());
        JplHorizonsProvider {
            shared,
            config,
            parser,
        }
    }

    /// Maps a body name to its Horizons designator; anything unknown
    /// passes through for Horizons to resolve.
    pub fn target_designator(name: &str) -> &str {
        let lower = name.trim().to_lowercase();
        for (body, designator) in &TARGET_DESIGNATORS {
            if *body == lower {
                return designator;
            }
        }
        name
    }

    fn build_url(
        &self,
        target: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        observer: Option<&ObserverLocation>,
    ) -> String {
        let mut url = format!(
            "{}?format=json&COMMAND='{}'&EPHEM_TYPE='observer'&MAKE_EPHEM='YES'",
            self.config.base_url,
            Self::target_designator(target)
        );
        match observer {
            Some(site) => {
                // Topocentric: geodetic observer site on Earth.
                url.push_str("&CENTER='coord@399'&COORD_TYPE='GEODETIC'");
                url.push_str(&format!(
                    "&SITE_COORD='{:.4},{:.4},{:.3}'",
                    site.longitude_deg,
                    site.latitude_deg,
                    site.elevation_m / 1000.0
                ));
            }
            None => url.push_str("&CENTER='@399'"),
        }
        url.push_str(&format!(
            "&START_TIME='{}'&STOP_TIME='{}'&STEP_SIZE='{} m'",
            start.format("%Y-%m-%d %H:%M"),
            stop.format("%Y-%m-%d %H:%M"),
            self.config.step_minutes.max(1)
        ));
        url.push_str("&QUANTITIES='1,2,14,19'");
        url
    }

    /// Fetches an ephemeris series for `target` covering
    /// [start, stop]. Does not consult the cache; `query` layers that.
    pub fn ephemeris_series(
        &self,
        target: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        observer: Option<&ObserverLocation>,
    ) -> Result<Vec<EphemerisPoint>, QueryError> {
        self.shared.admit(PROVIDER_NAME, self.config.timeout)?;

        let url = self.build_url(target, start, stop, observer);
        debug!("Horizons query URL: {}", url);

        let response = self
            .shared
            .http
            .perform(&HttpRequest {
                url,
                timeout: self.config.timeout,
                ..Default::default()
            })
            .map_err(|e| {
                self.shared.complete(PROVIDER_NAME, false);
                QueryError::new(QueryErrorCode::NetworkError, PROVIDER_NAME, &e)
            })?;

        if let Some(error) = self.shared.map_status(PROVIDER_NAME, &response) {
            self.shared.complete(PROVIDER_NAME, false);
            return Err(error);
        }

        let points = self.decode_observer_table(&response.body).map_err(|e| {
            self.shared.complete(PROVIDER_NAME, false);
            e
        })?;

        self.shared.complete(PROVIDER_NAME, true);
        info!("Horizons returned {} ephemeris points for {}", points.len(), target);
        Ok(points)
    }

    /// Decodes the Horizons JSON body: the `result` member is a text
    /// report whose data lines sit between `$$SOE` and `$$EOE`.
    fn decode_observer_table(&self, body: &str) -> Result<Vec<EphemerisPoint>, QueryError> {
        let document: Value = serde_json::from_str(body).map_err(|e| {
            QueryError::new(
                QueryErrorCode::ParseError,
                PROVIDER_NAME,
                &format!("JSON parse error: {}", e),
            )
            .with_raw_response(body)
        })?;

        let report = document
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                QueryError::new(
                    QueryErrorCode::ParseError,
                    PROVIDER_NAME,
                    "Horizons response has no result member",
                )
                .with_raw_response(body)
            })?;

        let mut rows: Vec<Value> = vec![];
        let mut in_data = false;
        for line in report.lines() {
            if line.contains("$$SOE") {
                in_data = true;
                continue;
            }
            if line.contains("$$EOE") {
                break;
            }
            if !in_data || line.trim().is_empty() {
                continue;
            }
            match observer_line_to_json(line) {
                Some(row) => rows.push(row),
                None => warn!("Skipping unparsable Horizons line: {}", line),
            }
        }

        let body_for_parser = json!({ "result": rows }).to_string();
        self.parser
            .parse_ephemeris(&body_for_parser)
            .map_err(|e| {
                QueryError::new(
                    QueryErrorCode::ParseError,
                    PROVIDER_NAME,
                    &format!("{}", e),
                )
            })
    }
}

/// Parses one observer-table data line into the JSON shape the
/// ephemeris extractor reads. The leading field is the timestamp;
/// the remaining numeric fields are taken in order as RA, Dec,
/// delta, magnitude, elongation and phase angle.
fn observer_line_to_json(line: &str) -> Option<Value> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return None;
    }

    let datetime = parse_horizons_datetime(fields[0])?;
    let numbers: Vec<f64> = fields[1..]
        .iter()
        .filter_map(|f| f.parse::<f64>().ok())
        .collect();
    if numbers.len() < 2 {
        return None;
    }

    let mut row = json!({
        "datetime": datetime.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "RA": numbers[0],
        "DEC": numbers[1],
    });
    let keys = ["delta", "mag", "elong", "phase"];
    for (i, key) in keys.iter().enumerate() {
        if let Some(value) = numbers.get(2 + i) {
            row[*key] = json!(value);
        }
    }
    Some(row)
}

/// Horizons timestamps look like "2024-Jun-01 00:00" (optionally with
/// seconds).
fn parse_horizons_datetime(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    for format in ["%Y-%b-%d %H:%M:%S", "%Y-%b-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

impl CatalogProvider for JplHorizonsProvider {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        match request.kind {
            QueryKind::Ephemeris | QueryKind::ByName => {}
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Query kind not supported by JPL Horizons",
                ));
            }
        }
        if request.term.is_empty() {
            return Err(QueryError::new(
                QueryErrorCode::InvalidQuery,
                PROVIDER_NAME,
                "Horizons query requires a target name",
            ));
        }

        if self.config.use_cache {
            if let Some(hit) = self.shared.cached(PROVIDER_NAME, request) {
                return Ok(hit);
            }
        }

        let start = Instant::now();
        let stop = request.epoch + chrono::Duration::hours(1);
        let points = self.ephemeris_series(
            &request.term,
            request.epoch,
            stop,
            request.observer.as_ref(),
        )?;

        // A point lookup that comes back empty is a hard miss; list
        // semantics keep the empty series.
        if points.is_empty() && request.kind == QueryKind::Ephemeris {
            return Err(QueryError::new(
                QueryErrorCode::NotFound,
                PROVIDER_NAME,
                &format!("No ephemeris data for {}", request.term),
            ));
        }

        let records = match request.kind {
            QueryKind::ByName => points
                .first()
                .map(|point| {
                    vec![CelestialRecord {
                        identifier: request.term.clone(),
                        ra_deg: point.ra_deg,
                        ra_string: point.ra_deg.to_string(),
                        dec_deg: point.dec_deg,
                        dec_string: point.dec_deg.to_string(),
                        visual_magnitude: point.magnitude,
                        object_type: "Solar System Body".to_string(),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            _ => vec![],
        };

        let result = QueryResult {
            total_available: points.len().max(records.len()),
            records,
            ephemeris: points,
            provider: PROVIDER_NAME.to_string(),
            query_time: start.elapsed(),
            from_cache: false,
        };
        if self.config.use_cache {
            self.shared.store(PROVIDER_NAME, request, &result);
        }
        Ok(result)
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        // Probe with a one-hour lunar ephemeris.
        let now = Utc::now();
        let url = self.build_url("moon", now, now + chrono::Duration::hours(1), None);
        match self.shared.http.perform(&HttpRequest {
            url,
            timeout: Duration::from_secs(5),
            ..Default::default()
        }) {
            Ok(response) => response.status == 200,
            Err(_) => false,
        }
    }

    fn supported_kinds(&self) -> Vec<QueryKind> {
        vec![QueryKind::ByName, QueryKind::Ephemeris]
    }

    fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    use super::*;
    use crate::http_client::testing::ScriptedTransport;
    use crate::http_client::{HttpClient, HttpClientConfig};

    fn horizons_body() -> String {
        let report = "Ephemeris / API_USER\n\
                      $$SOE\n\
                      2024-Jun-01 00:00, , , 120.50000, -10.20000, 1.52000, -1.20, 45.00, 30.10,\n\
                      2024-Jun-01 01:00, , , 120.60000, -10.10000, 1.53000, -1.20, 45.10, 30.00,\n\
                      $$EOE\n";
        json!({ "result": report }).to_string()
    }

    fn provider_with(
        responses: Vec<Result<crate::http_client::HttpResponse, String>>,
    ) -> JplHorizonsProvider {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let http = Arc::new(HttpClient::with_transport(
            transport,
            HttpClientConfig {
                max_retries: 0,
                ..Default::default()
            },
        ));
        JplHorizonsProvider::new(
            ProviderShared::new(http, None, None),
            JplHorizonsConfig::default(),
        )
    }

    #[test]
    fn test_target_designators() {
        assert_eq!(JplHorizonsProvider::target_designator("Mars"), "499");
        assert_eq!(JplHorizonsProvider::target_designator("SUN"), "10");
        assert_eq!(JplHorizonsProvider::target_designator("2021 PH27"), "2021 PH27");
    }

    #[test]
    fn test_url_shape() {
        let provider = provider_with(vec![]);
        use chrono::TimeZone;
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let url = provider.build_url("mars", start, stop, None);
        assert!(url.contains("COMMAND='499'"));
        assert!(url.contains("EPHEM_TYPE='observer'"));
        assert!(url.contains("CENTER='@399'"));
        assert!(url.contains("START_TIME='2024-06-01 00:00'"));
        assert!(url.contains("QUANTITIES='1,2,14,19'"));
    }

    #[test]
    fn test_url_with_observer_site() {
        let provider = provider_with(vec![]);
        let now = Utc::now();
        let site = ObserverLocation {
            latitude_deg: 31.96,
            longitude_deg: -111.60,
            elevation_m: 2096.0,
        };
        let url = provider.build_url("moon", now, now, Some(&site));
        assert!(url.contains("CENTER='coord@399'"));
        assert!(url.contains("SITE_COORD='-111.6000,31.9600,2.096'"));
    }

    #[test]
    fn test_ephemeris_query_decodes_lines() {
        let provider = provider_with(vec![ScriptedTransport::ok(200, &horizons_body())]);
        let request = QueryRequest::ephemeris("Mars", Utc::now());
        let result = provider.query(&request).unwrap();
        assert_eq!(result.ephemeris.len(), 2);
        let point = &result.ephemeris[0];
        assert_abs_diff_eq!(point.ra_deg, 120.5, epsilon = 1e-9);
        assert_abs_diff_eq!(point.dec_deg, -10.2, epsilon = 1e-9);
        assert_abs_diff_eq!(point.distance_au, 1.52, epsilon = 1e-9);
        assert_abs_diff_eq!(point.magnitude, -1.2, epsilon = 1e-9);
        assert!(result.ephemeris[1].time > point.time);
    }

    #[test]
    fn test_by_name_yields_record() {
        let provider = provider_with(vec![ScriptedTransport::ok(200, &horizons_body())]);
        let result = provider.query(&QueryRequest::by_name("Mars")).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].identifier, "Mars");
        assert_abs_diff_eq!(result.records[0].ra_deg, 120.5, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_series_is_not_found_for_point_query() {
        let empty = json!({ "result": "$$SOE\n$$EOE\n" }).to_string();
        let provider = provider_with(vec![ScriptedTransport::ok(200, &empty)]);
        let err = provider
            .query(&QueryRequest::ephemeris("Nothing", Utc::now()))
            .unwrap_err();
        assert_eq!(err.code, QueryErrorCode::NotFound);
    }

    #[test]
    fn test_missing_result_member_is_parse_error() {
        let provider = provider_with(vec![ScriptedTransport::ok(200, "{}")]);
        let err = provider
            .query(&QueryRequest::ephemeris("Mars", Utc::now()))
            .unwrap_err();
        assert_eq!(err.code, QueryErrorCode::ParseError);
    }

}  // mod tests.
