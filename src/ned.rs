// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::http_client::HttpRequest;
use crate::provider::{url_encode, CatalogProvider, ProviderShared};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};
use crate::response_parser::ResponseParser;
use crate::votable_parser::{VotableFieldMapping, VotableParser};

const PROVIDER_NAME: &str = "NED";
const BASE_URL: &str = "https://ned.ipac.caltech.edu/tap/sync";

#[derive(Clone, Debug)]
pub struct NedConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub use_cache: bool,
}

impl Default for NedConfig {
    fn default() -> Self {
        NedConfig {
            base_url: BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            use_cache: true,
        }
    }
}

/// Adapter for the NASA/IPAC Extragalactic Database TAP service.
/// Object names are normalized to upper case before the LIKE match,
/// which is how NED stores its preferred names.
pub struct NedProvider {
    shared: ProviderShared,
    config: NedConfig,
    parser: VotableParser,
}

impl NedProvider {
    pub fn new(shared: ProviderShared, config: NedConfig) -> Self {
        let mappings = vec![
            VotableFieldMapping::new("prefname", "identifier"),
            VotableFieldMapping::new("ra", "ra"),
            VotableFieldMapping::new("dec", "dec"),
            VotableFieldMapping::new("pretype", "type"),
        ];
        NedProvider {
            shared,
            config,
            parser: VotableParser::with_mappings(mappings),
        }
    }

    pub fn build_adql(&self, request: &QueryRequest) -> Result<String, QueryError> {
        let select = format!(
            "SELECT TOP {} prefname, ra, dec, pretype FROM NEDTAP.objdir",
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
                let normalized = request.term.to_uppercase().replace('\'', "''");
                format!("prefname LIKE '{}%'", normalized)
            }
            QueryKind::ByCoordinates => {
                match (request.ra_deg, request.dec_deg, request.radius_deg) {
                    (Some(ra), Some(dec), Some(radius)) => format!(
                        "CONTAINS(POINT('ICRS', ra, dec), \
                         CIRCLE('ICRS', {:.6}, {:.6}, {:.6})) = 1",
                        ra, dec, radius
                    ),
                    _ => {
                        return Err(QueryError::new(
                            QueryErrorCode::InvalidQuery,
                            PROVIDER_NAME,
                            "Cone search requires ra, dec and radius",
                        ));
                    }
                }
            }
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Query kind not supported by NED",
                ));
            }
        };

        Ok(format!("{} WHERE {}", select, condition))
    }

    fn build_url(&self, adql: &str) -> String {
        format!(
            "{}?request=doQuery&lang=adql&format=votable&query={}",
            self.config.base_url,
            url_encode(adql)
        )
    }
}

impl CatalogProvider for NedProvider {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        if self.config.use_cache {
            if let Some(hit) = self.shared.cached(PROVIDER_NAME, request) {
                debug!("NED cache hit for {:?}", request.term);
                return Ok(hit);
            }
        }
        self.shared.admit(PROVIDER_NAME, self.config.timeout)?;

        let adql = self.build_adql(request)?;
        debug!("NED ADQL: {}", adql);

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
        info!("NED query returned {} records", records.len());

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
        let mut request = QueryRequest::by_name("M31");
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
        vec![QueryKind::ByName, QueryKind::ByCoordinates]
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

    fn provider_with(
        responses: Vec<Result<crate::http_client::HttpResponse, String>>,
    ) -> NedProvider {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let http = Arc::new(HttpClient::with_transport(
            transport,
            HttpClientConfig {
                max_retries: 0,
                ..Default::default()
            },
        ));
        NedProvider::new(ProviderShared::new(http, None, None), NedConfig::default())
    }

    #[test]
    fn test_name_is_uppercased() {
        let provider = provider_with(vec![]);
        let adql = provider
            .build_adql(&QueryRequest::by_name("messier 031"))
            .unwrap();
        assert!(adql.contains("LIKE 'MESSIER 031%'"));
    }

    #[test]
    fn test_cone_search_shape() {
        let provider = provider_with(vec![]);
        let adql = provider
            .build_adql(&QueryRequest::cone_search(10.6847, 41.2689, 0.2))
            .unwrap();
        assert!(adql.contains("NEDTAP.objdir"));
        assert!(adql.contains("CIRCLE('ICRS', 10.684700, 41.268900, 0.200000)"));
    }

    #[test]
    fn test_query_parses_prefname_rows() {
        let body = "<VOTABLE><RESOURCE><TABLE>\
                    <FIELD name=\"prefname\"/><FIELD name=\"ra\"/>\
                    <FIELD name=\"dec\"/><FIELD name=\"pretype\"/>\
                    <DATA><TABLEDATA>\
                    <TR><TD>MESSIER 031</TD><TD>10.68479</TD>\
                    <TD>41.26906</TD><TD>G</TD></TR>\
                    </TABLEDATA></DATA></TABLE></RESOURCE></VOTABLE>";
        let provider = provider_with(vec![ScriptedTransport::ok(200, body)]);
        let result = provider.query(&QueryRequest::by_name("M31")).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].identifier, "MESSIER 031");
        assert_eq!(result.records[0].object_type, "G");
    }

    #[test]
    fn test_ephemeris_unsupported() {
        let provider = provider_with(vec![]);
        assert!(!provider.supports_kind(QueryKind::Ephemeris));
    }

}  // mod tests.
