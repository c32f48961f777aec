// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

use crate::celestial_record::CelestialRecord;
use crate::coords::{angular_separation_deg, parse_dec_degrees, parse_ra_hours};
use crate::http_client::HttpRequest;
use crate::provider::{CatalogProvider, ProviderShared};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};

const PROVIDER_NAME: &str = "OpenNGC";
const DATA_URL: &str =
    "https://raw.githubusercontent.com/mattiaverga/OpenNGC/master/database_files/NGC.csv";

#[derive(Clone, Debug)]
pub struct OpenNgcConfig {
    pub data_url: String,
    pub timeout: Duration,
    pub use_cache: bool,

    /// Rebuild the in-memory index when it is older than this.
    /// None disables auto-refresh.
    pub refresh_interval: Option<Duration>,
}

impl Default for OpenNgcConfig {
    fn default() -> Self {
        OpenNgcConfig {
            data_url: DATA_URL.to_string(),
            timeout: Duration::from_secs(60),
            use_cache: true,
            refresh_interval: None,
        }
    }
}

/// One row of the OpenNGC CSV. Column order:
/// Name;Type;RA;Dec;Const;MajAx;MinAx;PosAng;B-Mag;V-Mag;SurfBr;
/// Hubble;Messier;NGC;IC.
#[derive(Clone, Debug, Default)]
struct NgcRow {
    name: String,
    object_type: String,
    ra_string: String,
    ra_deg: f64,
    dec_string: String,
    dec_deg: f64,
    constellation: String,
    major_axis: f64,
    minor_axis: f64,
    position_angle: f64,
    b_magnitude: f64,
    v_magnitude: f64,
    surface_brightness: f64,
    hubble_type: String,
    messier: String,
    ngc: String,
    ic: String,
}

impl NgcRow {
    fn to_record(&self) -> CelestialRecord {
        let mut aliases = vec![];
        if !self.messier.is_empty() {
            aliases.push(format!("M{}", self.messier));
        }
        if !self.ngc.is_empty() {
            aliases.push(format!("NGC{}", self.ngc));
        }
        if !self.ic.is_empty() {
            aliases.push(format!("IC{}", self.ic));
        }
        CelestialRecord {
            identifier: self.name.clone(),
            m_identifier: self.messier.clone(),
            ngc_identifier: self.ngc.clone(),
            ic_identifier: self.ic.clone(),
            aliases: aliases.join(","),
            ra_string: self.ra_string.clone(),
            ra_deg: self.ra_deg,
            dec_string: self.dec_string.clone(),
            dec_deg: self.dec_deg,
            object_type: self.object_type.clone(),
            morphology: self.hubble_type.clone(),
            constellation_en: self.constellation.clone(),
            visual_magnitude: self.v_magnitude,
            photographic_magnitude: self.b_magnitude,
            surface_brightness: self.surface_brightness,
            major_axis_arcmin: self.major_axis,
            minor_axis_arcmin: self.minor_axis,
            position_angle_deg: self.position_angle,
            ..Default::default()
        }
    }
}

// The catalog index. Name keys are upper-cased; the Messier alias map
// is list-valued since several rows can share one designation.
struct CatalogIndex {
    rows: Vec<NgcRow>,
    by_name: HashMap<String, usize>,
    by_messier: HashMap<String, Vec<usize>>,
    loaded_at: Instant,
    loaded_wall: SystemTime,
}

impl CatalogIndex {
    fn build(rows: Vec<NgcRow>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_messier: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            by_name.insert(row.name.to_uppercase(), i);
            if !row.messier.is_empty() {
                let key = format!("M{}", normalize_messier(&row.messier));
                by_messier.entry(key).or_default().push(i);
            }
        }
        CatalogIndex {
            rows,
            by_name,
            by_messier,
            loaded_at: Instant::now(),
            loaded_wall: SystemTime::now(),
        }
    }
}

// "031" and "31" address the same Messier entry.
fn normalize_messier(s: &str) -> String {
    let stripped = s.trim().trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// Local adapter for the OpenNGC catalog: a semicolon-delimited CSV
/// downloaded once and answered from memory. Queries take a read
/// lock; a refresh rebuilds the index off-lock and publishes it
/// atomically under the write lock, so readers never observe a
/// partially built index.
pub struct OpenNgcProvider {
    shared: ProviderShared,
    config: OpenNgcConfig,
    index: RwLock<Option<CatalogIndex>>,
}

impl OpenNgcProvider {
    pub fn new(shared: ProviderShared, config: OpenNgcConfig) -> Self {
        OpenNgcProvider {
            shared,
            config,
            index: RwLock::new(None),
        }
    }

    /// Downloads the catalog and hot-swaps the in-memory index.
    pub fn refresh_catalog(&self) -> Result<(), QueryError> {
        let response = self
            .shared
            .http
            .perform(&HttpRequest {
                url: self.config.data_url.clone(),
                timeout: self.config.timeout,
                ..Default::default()
            })
            .map_err(|e| {
                QueryError::new(QueryErrorCode::NetworkError, PROVIDER_NAME, &e)
            })?;
        if let Some(error) = self.shared.map_status(PROVIDER_NAME, &response) {
            return Err(error);
        }

        let rows = parse_catalog_csv(&response.body)?;
        info!("Loaded OpenNGC catalog with {} objects", rows.len());

        let new_index = CatalogIndex::build(rows);
        *self.index.write().unwrap() = Some(new_index);
        Ok(())
    }

    /// (entry count, wall-clock time of the last successful load).
    pub fn catalog_stats(&self) -> Option<(usize, SystemTime)> {
        let guard = self.index.read().unwrap();
        guard
            .as_ref()
            .map(|index| (index.rows.len(), index.loaded_wall))
    }

    fn ensure_loaded(&self) -> Result<(), QueryError> {
        let needs_load = {
            let guard = self.index.read().unwrap();
            match guard.as_ref() {
                None => true,
                Some(index) => match self.config.refresh_interval {
                    Some(interval) => index.loaded_at.elapsed() > interval,
                    None => false,
                },
            }
        };
        if needs_load {
            self.refresh_catalog()?;
        }
        Ok(())
    }

    fn query_by_name(&self, index: &CatalogIndex, request: &QueryRequest) -> Vec<CelestialRecord> {
        let term = request.term.trim().to_uppercase();
        if term.is_empty() {
            return vec![];
        }
        let mut hits: Vec<usize> = vec![];

        // Messier aliases resolve to every row that carries them.
        if let Some(indices) = index.by_messier.get(&normalize_messier_key(&term)) {
            hits.extend(indices.iter().copied());
        }
        if let Some(&i) = index.by_name.get(&term) {
            if !hits.contains(&i) {
                hits.push(i);
            }
        }
        // Prefix scan for partial identifiers, e.g. "NGC22".
        for (i, row) in index.rows.iter().enumerate() {
            if hits.len() >= request.limit {
                break;
            }
            if row.name.to_uppercase().starts_with(&term) && !hits.contains(&i) {
                hits.push(i);
            }
        }

        hits.truncate(request.limit);
        hits.iter().map(|&i| index.rows[i].to_record()).collect()
    }

    fn query_by_coordinates(
        &self,
        index: &CatalogIndex,
        request: &QueryRequest,
    ) -> Result<(Vec<CelestialRecord>, usize), QueryError> {
        let (ra, dec, radius) = match (request.ra_deg, request.dec_deg, request.radius_deg) {
            (Some(ra), Some(dec), Some(radius)) => (ra, dec, radius),
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Coordinate search requires ra, dec and radius",
                ));
            }
        };

        let mut candidates: Vec<(f64, usize)> = index
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let distance = angular_separation_deg(ra, dec, row.ra_deg, row.dec_deg);
                if distance <= radius {
                    Some((distance, i))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let total = candidates.len();
        let records = candidates
            .iter()
            .take(request.limit)
            .map(|&(_, i)| index.rows[i].to_record())
            .collect();
        Ok((records, total))
    }

    fn query_catalog(&self, index: &CatalogIndex, request: &QueryRequest) -> Vec<CelestialRecord> {
        let catalog = request
            .catalog
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_uppercase();
        index
            .rows
            .iter()
            .filter(|row| match catalog.as_str() {
                "M" | "MESSIER" => !row.messier.is_empty(),
                "IC" => row.name.to_uppercase().starts_with("IC"),
                // NGC rows and the default case.
                _ => row.name.to_uppercase().starts_with("NGC"),
            })
            .take(request.limit)
            .map(NgcRow::to_record)
            .collect()
    }
}

fn normalize_messier_key(term: &str) -> String {
    match term.strip_prefix('M') {
        Some(number) => format!("M{}", normalize_messier(number.trim())),
        None => term.to_string(),
    }
}

fn parse_catalog_csv(body: &str) -> Result<Vec<NgcRow>, QueryError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut rows = vec![];
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            QueryError::new(
                QueryErrorCode::ParseError,
                PROVIDER_NAME,
                &format!("CSV error on data line {}: {}", line + 1, e),
            )
        })?;
        if record.len() < 10 {
            debug!("Skipping short OpenNGC line {}", line + 1);
            continue;
        }
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        let number = |i: usize| parse_catalog_number(record.get(i).unwrap_or(""));

        let name = field(0);
        if name.is_empty() {
            continue;
        }

        rows.push(NgcRow {
            ra_deg: parse_ra_hours(&field(2)).unwrap_or(0.0),
            dec_deg: parse_dec_degrees(&field(3)).unwrap_or(0.0),
            name,
            object_type: field(1),
            ra_string: field(2),
            dec_string: field(3),
            constellation: field(4),
            major_axis: number(5),
            minor_axis: number(6),
            position_angle: number(7),
            b_magnitude: number(8),
            v_magnitude: number(9),
            surface_brightness: number(10),
            hubble_type: field(11),
            messier: field(12),
            ngc: field(13),
            ic: field(14),
        });
    }
    Ok(rows)
}

fn parse_catalog_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "N/A" {
        return 0.0;
    }
    trimmed.parse().unwrap_or(0.0)
}

impl CatalogProvider for OpenNgcProvider {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        if self.config.use_cache {
            if let Some(hit) = self.shared.cached(PROVIDER_NAME, request) {
                return Ok(hit);
            }
        }
        self.ensure_loaded()?;

        let start = Instant::now();
        let guard = self.index.read().unwrap();
        let index = guard.as_ref().ok_or_else(|| {
            QueryError::new(
                QueryErrorCode::ServiceUnavailable,
                PROVIDER_NAME,
                "OpenNGC catalog not loaded",
            )
        })?;

        let (records, total_available) = match request.kind {
            QueryKind::ByName => {
                let records = self.query_by_name(index, request);
                let total = records.len();
                (records, total)
            }
            QueryKind::ByCoordinates => self.query_by_coordinates(index, request)?,
            QueryKind::Catalog => {
                let records = self.query_catalog(index, request);
                let total = records.len();
                (records, total)
            }
            _ => {
                return Err(QueryError::new(
                    QueryErrorCode::InvalidQuery,
                    PROVIDER_NAME,
                    "Query kind not supported by OpenNGC",
                ));
            }
        };
        drop(guard);

        let result = QueryResult {
            records,
            ephemeris: vec![],
            provider: PROVIDER_NAME.to_string(),
            query_time: start.elapsed(),
            from_cache: false,
            total_available,
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
        if self.catalog_stats().map(|(n, _)| n > 0).unwrap_or(false) {
            return true;
        }
        match self.refresh_catalog() {
            Ok(()) => true,
            Err(e) => {
                warn!("OpenNGC availability check failed: {}", e);
                false
            }
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
        &self.config.data_url
    }
}

// mod tests.
