// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::http_client::HttpRequest;
use crate::provider::{url_encode, CatalogProvider, ProviderShared};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};
use crate::response_parser::ResponseParser;
use crate::votable_parser::VotableParser;

const PROVIDER_NAME: &str = "SIMBAD";
const BASE_URL: &str = "https://simbad.u-strasbg.fr/simbad/sim-tap/sync";

#[derive(Clone, Debug)]
pub struct SimbadConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub use_cache: bool,
}

impl Default for SimbadConfig {
    fn default() -> Self {
        SimbadConfig {
            base_url: BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            use_cache: true,
        }
    }
}

/// Adapter for the CDS SIMBAD database via its TAP sync endpoint.
/// Queries are ADQL over the `basic` table (joined against
/// `allfluxes` for magnitudes); responses are VOTable.
pub struct SimbadProvider {
    shared: ProviderShared,
    config: SimbadConfig,
    parser: VotableParser,
}

impl SimbadProvider {
    pub fn new(shared: ProviderShared, config: SimbadConfig) -> Self {
        SimbadProvider {
            shared,
            config,
            parser: VotableParser::with_mappings(VotableParser::simbad_mappings()),
        }
    }

    /// Builds the ADQL statement for `request`. Name lookups use LIKE
    /// with a trailing wildcard; cone searches use
    /// CONTAINS(POINT, CIRCLE).
    pub fn build_adql(&self, request: &QueryRequest) -> Result<String, QueryError> {
        let select = format!(
            "SELECT TOP {} basic.main_id, basic.ra, basic.dec, \
             basic.otype_txt, basic.morph_type, allfluxes.V, allfluxes.B \
             FROM basic LEFT JOIN allfluxes ON basic.oid = allfluxes.oidref",
            request.limit.max(1)
        );

        let condition = match request.kind {
            QueryKind::ByName => {
                if request.term.is_empty() {
                    return Err(QueryError::new(
                        QueryErrorCode::InvalidQuery,
                        PROVIDER_NAME,
                        "Name query requires a search term",
                    ));
                }
                format!("basic.main_id LIKE '{}%'", escape_adql(&request.term))
            }
            QueryKind::ByCoordinates => {
                let (ra, dec, radius) = cone_params(request)?;
                format!(
                    "CONTAINS(POINT('ICRS', basic.ra, basic.dec), \
                     CIRCLE('ICRS', {:.6}, {:.6}, {:.6})) = 1",
                    ra, dec, radius
                )
            }
            QueryKind::Catalog => {
                let catalog = request.catalog.as_deref().unwrap_or("");
                if catalog.is_empty() {
                    return Err(QueryError::new(
                        QueryErrorCode::InvalidQuery,
                        PROVIDER_NAME,
                        "Catalog query requires a catalog name",
                    ));
                }
                format!("basic.main_id LIKE '{} %'", escape_adql(catalog))
            }
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Query kind not supported by SIMBAD",
                ));
            }
        };

        let mut adql = format!("{} WHERE {}", select, condition);
        if let Some(max) = request.max_magnitude {
            adql.push_str(&format!(" AND allfluxes.V <= {:.2}", max));
        }
        if let Some(min) = request.min_magnitude {
            adql.push_str(&format!(" AND allfluxes.V >= {:.2}", min));
        }
        Ok(adql)
    }

    fn build_url(&self, adql: &str) -> String {
        format!(
            "{}?request=doQuery&lang=adql&format=votable&query={}",
            self.config.base_url,
            url_encode(adql)
        )
    }
}

fn escape_adql(term: &str) -> String {
    term.replace('\'', "''")
}

fn cone_params(request: &QueryRequest) -> Result<(f64, f64, f64), QueryError> {
    match (request.ra_deg, request.dec_deg, request.radius_deg) {
        (Some(ra), Some(dec), Some(radius)) => Ok((ra, dec, radius)),
        _ => Err(QueryError::new(
            QueryErrorCode::InvalidQuery,
            PROVIDER_NAME,
            "Cone search requires ra, dec and radius",
        )),
    }
}

impl CatalogProvider for SimbadProvider {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        if self.config.use_cache {
            if let Some(hit) = self.shared.cached(PROVIDER_NAME, request) {
                return Ok(hit);
            }
        }
        self.shared.admit(PROVIDER_NAME, self.config.timeout)?;

        let adql = self.build_adql(request)?;
        debug!("SIMBAD ADQL: {}", adql);

        let start = Instant::now();
        let response = self
            .shared
            .http
            .perform(&HttpRequest {
                url: self.build_url(&adql),
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

        let records = self.parser.parse(&response.body).map_err(|e| {
            self.shared.complete(PROVIDER_NAME, false);
            QueryError::new(
                QueryErrorCode::ParseError,
                PROVIDER_NAME,
                &format!("{}", e),
            )
            .with_raw_response(&response.body)
        })?;

        self.shared.complete(PROVIDER_NAME, true);
        info!("SIMBAD query returned {} records", records.len());

        let result = QueryResult {
            total_available: records.len(),
            records,
            ephemeris: vec![],
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
        // Health check: resolve a well-known object cheaply.
        let mut request = QueryRequest::by_name("M 31");
        request.limit = 1;
        let adql = match self.build_adql(&request) {
            Ok(adql) => adql,
            Err(_) => return false,
        };
        match self.shared.http.perform(&HttpRequest {
            url: self.build_url(&adql),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }) {
            Ok(response) => response.status == 200,
            Err(_) => false,
        }
    }

    fn supported_kinds(&self) -> Vec<QueryKind> {
        vec![
            QueryKind::ByName,
            QueryKind::ByCoordinates,
            QueryKind::Catalog,
        ]
    }

    fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http_client::testing::ScriptedTransport;
    use crate::http_client::{HttpClient, HttpClientConfig};

    fn votable_body() -> &'static str {
        "<VOTABLE><RESOURCE><TABLE>\
         <FIELD name=\"main_id\"/><FIELD name=\"ra\"/><FIELD name=\"dec\"/>\
         <FIELD name=\"otype_txt\"/><FIELD name=\"V\"/>\
         <DATA><TABLEDATA>\
         <TR><TD>M  31</TD><TD>10.6847</TD><TD>41.2689</TD>\
         <TD>Galaxy</TD><TD>3.44</TD></TR>\
         </TABLEDATA></DATA></TABLE></RESOURCE></VOTABLE>"
    }

    fn provider_with(
        responses: Vec<Result<crate::http_client::HttpResponse, String>>,
    ) -> (SimbadProvider, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let http = Arc::new(HttpClient::with_transport(
            transport.clone(),
            HttpClientConfig {
                max_retries: 0,
                ..Default::default()
            },
        ));
        let shared = ProviderShared::new(http, None, None);
        (SimbadProvider::new(shared, SimbadConfig::default()), transport)
    }

    #[test]
    fn test_adql_by_name() {
        let (provider, _) = provider_with(vec![]);
        let adql = provider.build_adql(&QueryRequest::by_name("M 31")).unwrap();
        assert!(adql.contains("main_id LIKE 'M 31%'"));
        assert!(adql.starts_with("SELECT TOP 100"));
    }

    #[test]
    fn test_adql_cone_search() {
        let (provider, _) = provider_with(vec![]);
        let adql = provider
            .build_adql(&QueryRequest::cone_search(10.6847, 41.2689, 0.5))
            .unwrap();
        assert!(adql.contains("CONTAINS(POINT('ICRS'"));
        assert!(adql.contains("CIRCLE('ICRS', 10.684700, 41.268900, 0.500000)"));
    }

    #[test]
    fn test_adql_escapes_quotes() {
        let (provider, _) = provider_with(vec![]);
        let adql = provider
            .build_adql(&QueryRequest::by_name("Barnard's Star"))
            .unwrap();
        assert!(adql.contains("Barnard''s Star"));
    }

    #[test]
    fn test_query_parses_votable() {
        let (provider, transport) = provider_with(vec![
            ScriptedTransport::ok(200, votable_body()),
        ]);
        let result = provider.query(&QueryRequest::by_name("M 31")).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].identifier, "M  31");
        assert_eq!(result.provider, "SIMBAD");
        assert!(!result.from_cache);

        // The ADQL rode in the URL, percent-encoded.
        let url = transport.requests.lock().unwrap()[0].url.clone();
        assert!(url.starts_with(BASE_URL));
        assert!(url.contains("query=SELECT%20TOP"));
    }

    #[test]
    fn test_http_error_mapping() {
        let (provider, _) = provider_with(vec![ScriptedTransport::ok(500, "oops")]);
        let err = provider.query(&QueryRequest::by_name("M 31")).unwrap_err();
        assert_eq!(err.code, QueryErrorCode::ServiceUnavailable);

        let (provider, _) = provider_with(vec![ScriptedTransport::ok(400, "bad")]);
        let err = provider.query(&QueryRequest::by_name("M 31")).unwrap_err();
        assert_eq!(err.code, QueryErrorCode::InvalidQuery);
    }

    #[test]
    fn test_parse_error_not_marked_retryable() {
        let (provider, _) = provider_with(vec![ScriptedTransport::ok(200, "not xml")]);
        let err = provider.query(&QueryRequest::by_name("M 31")).unwrap_err();
        assert_eq!(err.code, QueryErrorCode::ParseError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unsupported_kind_is_invalid_query() {
        let (provider, _) = provider_with(vec![]);
        let request = QueryRequest::ephemeris("Mars", chrono::Utc::now());
        let err = provider.query(&request).unwrap_err();
        assert_eq!(err.code, QueryErrorCode::InvalidQuery);
        assert!(!provider.supports_kind(QueryKind::Ephemeris));
    }

}  // mod tests.
