// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::http_client::HttpRequest;
use crate::provider::{url_encode, CatalogProvider, ProviderShared};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};
use crate::response_parser::ResponseParser;
use crate::votable_parser::VotableParser;

const PROVIDER_NAME: &str = "VizieR";
const BASE_URL: &str = "https://vizier.u-strasbg.fr/viz-bin/votable";

/// Friendly catalog names and their VizieR identifiers. The first
/// entry is the default for plain cone searches.
pub const DEFAULT_CATALOGS: [(&str, &str); 6] = [
    ("NGC2000", "VII/118"),
    ("Messier", "VII/1B"),
    ("Hipparcos", "I/239"),
    ("2MASS", "II/246"),
    ("UCAC4", "I/322A"),
    ("APASS", "II/336"),
];

#[derive(Clone, Debug)]
pub struct VizierConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub use_cache: bool,
    pub max_rows: usize,
}

impl Default for VizierConfig {
    fn default() -> Self {
        VizierConfig {
            base_url: BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            use_cache: true,
            max_rows: 200,
        }
    }
}

/// Adapter for the CDS VizieR catalog service. Cone searches use the
/// classic HTTP GET interface: `-source=<catalog>&-c=<ra>+<dec>`
/// with `-c.rs` in arcseconds; responses are VOTable.
pub struct VizierProvider {
    shared: ProviderShared,
    config: VizierConfig,
    parser: VotableParser,
}

impl VizierProvider {
    pub fn new(shared: ProviderShared, config: VizierConfig) -> Self {
        VizierProvider {
            shared,
            config,
            parser: VotableParser::with_mappings(VotableParser::vizier_mappings()),
        }
    }

    /// Resolves a friendly catalog name ("NGC2000") to its VizieR
    /// identifier; identifiers pass through untouched.
    pub fn resolve_catalog(name: &str) -> &str {
        for (friendly, vizier_id) in &DEFAULT_CATALOGS {
            if friendly.eq_ignore_ascii_case(name) {
                return vizier_id;
            }
        }
        name
    }

    pub fn build_url(&self, request: &QueryRequest) -> Result<String, QueryError> {
        let mut url = format!(
            "{}?-out.max={}&-out=Name,RAJ2000,DEJ2000,Vmag,Bmag,Const,MajAx,MinAx",
            self.config.base_url,
            request.limit.min(self.config.max_rows).max(1)
        );

        let catalog = match request.kind {
            QueryKind::ByCoordinates => request
                .catalog
                .as_deref()
                .map(Self::resolve_catalog)
                .unwrap_or(DEFAULT_CATALOGS[0].1),
            QueryKind::Catalog => match request.catalog.as_deref() {
                Some(catalog) if !catalog.is_empty() => Self::resolve_catalog(catalog),
                _ => {
                    return Err(QueryError::new(
                        QueryErrorCode::InvalidQuery,
                        PROVIDER_NAME,
                        "Catalog query requires a catalog identifier",
                    ));
                }
            },
            QueryKind::ByName => {
                if request.term.is_empty() {
                    return Err(QueryError::new(
                        QueryErrorCode::InvalidQuery,
                        PROVIDER_NAME,
                        "Name query requires a search term",
                    ));
                }
                url.push_str(&format!("&-c={}", url_encode(&request.term)));
                url.push_str("&-c.rs=60.00");
                url.push_str(&format!("&-source={}", url_encode(DEFAULT_CATALOGS[0].1)));
                return Ok(self.append_magnitude_filters(url, request));
            }
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Query kind not supported by VizieR",
                ));
            }
        };

        url.push_str(&format!("&-source={}", url_encode(catalog)));

        if let (Some(ra), Some(dec)) = (request.ra_deg, request.dec_deg) {
            let radius_deg = request.radius_deg.unwrap_or(0.5);
            let radius_arcsec = radius_deg * 3600.0;
            url.push_str(&format!("&-c={:.6}+{:.6}", ra, dec));
            url.push_str(&format!("&-c.rs={:.2}", radius_arcsec));
        } else if request.kind == QueryKind::ByCoordinates {
            return Err(QueryError::new(
                QueryErrorCode::InvalidQuery,
                PROVIDER_NAME,
                "Cone search requires ra and dec",
            ));
        }

        Ok(self.append_magnitude_filters(url, request))
    }

    fn append_magnitude_filters(&self, mut url: String, request: &QueryRequest) -> String {
        if let Some(min) = request.min_magnitude {
            url.push_str(&format!("&Vmag={}", url_encode(&format!(">{:.2}", min))));
        }
        if let Some(max) = request.max_magnitude {
            url.push_str(&format!("&Vmag={}", url_encode(&format!("<{:.2}", max))));
        }
        url
    }

    /// Convenience wrapper targeting one specific catalog.
    pub fn query_catalog(
        &self,
        catalog: &str,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let mut modified = request.clone();
        modified.kind = QueryKind::Catalog;
        modified.catalog = Some(catalog.to_string());
        self.query(&modified)
    }
}

impl CatalogProvider for VizierProvider {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        if self.config.use_cache {
            if let Some(hit) = self.shared.cached(PROVIDER_NAME, request) {
                return Ok(hit);
            }
        }
        self.shared.admit(PROVIDER_NAME, self.config.timeout)?;

        let url = self.build_url(request)?;
        debug!("VizieR query URL: {}", url);

        let start = Instant::now();
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
        info!("VizieR query returned {} records", records.len());

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
        // Cone search at M31 with a tight radius as a health probe.
        let mut request = QueryRequest::cone_search(10.6847, 41.2689, 0.1);
        request.limit = 1;
        let url = match self.build_url(&request) {
            Ok(url) => url,
            Err(_) => return false,
        };
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

// mod tests.
