// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

use crate::celestial_record::{CelestialRecord, EphemerisPoint};
use crate::http_client::{HttpClient, HttpClientConfig, HttpTransport};
use crate::jpl_horizons::{JplHorizonsConfig, JplHorizonsProvider};
use crate::ned::{NedConfig, NedProvider};
use crate::open_ngc::{OpenNgcConfig, OpenNgcProvider};
use crate::provider::{CatalogProvider, ProviderShared};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};
use crate::query_cache::{CacheConfig, CacheStats, QueryCache};
use crate::rate_limiter::{ApiRateLimiter, RateLimitRule};
use crate::result_merger::{MergeConfig, MergeStrategy, ResultMerger};
use crate::simbad::{SimbadConfig, SimbadProvider};
use crate::vizier::{VizierConfig, VizierProvider};

/// Per-provider settings recognized by the service configuration.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub timeout: Option<Duration>,
    pub base_url: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            enabled: true,
            timeout: None,
            base_url: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Per-provider overrides, keyed by provider name. Providers
    /// without an entry run with defaults, enabled.
    pub providers: HashMap<String, ProviderSettings>,

    pub cache: CacheConfig,
    pub http: HttpClientConfig,

    /// Local quota per provider, installed on initialize.
    pub rate_limits: HashMap<String, RateLimitRule>,

    pub enable_fallback: bool,
    pub max_retries: usize,
    pub retry_delay: Duration,

    pub max_concurrent_providers: usize,
    pub query_timeout: Duration,
    pub total_timeout: Duration,

    pub default_merge_strategy: MergeStrategy,
    pub default_limit: usize,

    /// Fallback order for query_auto / query_with_fallback.
    pub provider_priority: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "SIMBAD".to_string(),
            RateLimitRule {
                max_per_second: 2,
                max_per_minute: 60,
                max_per_hour: 1000,
                burst: 4,
            },
        );
        rate_limits.insert(
            "VizieR".to_string(),
            RateLimitRule {
                max_per_second: 2,
                max_per_minute: 60,
                max_per_hour: 1000,
                burst: 4,
            },
        );
        rate_limits.insert(
            "NED".to_string(),
            RateLimitRule {
                max_per_second: 1,
                max_per_minute: 30,
                max_per_hour: 500,
                burst: 2,
            },
        );
        rate_limits.insert(
            "JPL_Horizons".to_string(),
            RateLimitRule {
                max_per_second: 1,
                max_per_minute: 30,
                max_per_hour: 300,
                burst: 2,
            },
        );

        SearchConfig {
            providers: HashMap::new(),
            cache: CacheConfig::default(),
            http: HttpClientConfig::default(),
            rate_limits,
            enable_fallback: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_concurrent_providers: 3,
            query_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            default_merge_strategy: MergeStrategy::PreferLocal,
            default_limit: 100,
            provider_priority: vec![
                "SIMBAD".to_string(),
                "VizieR".to_string(),
                "NED".to_string(),
                "OpenNGC".to_string(),
                "JPL_Horizons".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SearchStats {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub cached_queries: u64,
    pub failed_queries: u64,
    pub avg_query_time: Duration,
    pub total_query_time: Duration,
    pub queries_per_provider: HashMap<String, u64>,
    pub last_query: Option<SystemTime>,
}

/// Facade over the catalog providers. Owns the shared HTTP client,
/// cache and rate limiter, fans queries out across providers, applies
/// fallback ordering, and aggregates statistics.
pub struct SearchService {
    config: SearchConfig,
    cache: Arc<QueryCache>,
    limiter: Arc<ApiRateLimiter>,
    merger: ResultMerger,
    shared: ProviderShared,
    providers: HashMap<String, Arc<dyn CatalogProvider>>,
    enabled: RwLock<HashMap<String, bool>>,
    stats: Mutex<SearchStats>,
}

impl SearchService {
    pub fn new(config: SearchConfig) -> Self {
        let http = Arc::new(HttpClient::new(config.http.clone()));
        Self::build(config, http)
    }

    /// Wires the service onto a caller-supplied transport. Tests use
    /// this to run the full stack against scripted responses.
    pub fn with_transport(config: SearchConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let http = Arc::new(HttpClient::with_transport(transport, config.http.clone()));
        Self::build(config, http)
    }

    fn build(config: SearchConfig, http: Arc<HttpClient>) -> Self {
        let cache = Arc::new(QueryCache::new(config.cache.clone()));
        let limiter = Arc::new(ApiRateLimiter::new());
        let shared = ProviderShared::new(http, Some(cache.clone()), Some(limiter.clone()));
        let merger = ResultMerger::new(MergeConfig {
            strategy: config.default_merge_strategy,
            max_results: config.default_limit,
            ..Default::default()
        });
        SearchService {
            config,
            cache,
            limiter,
            merger,
            shared,
            providers: HashMap::new(),
            enabled: RwLock::new(HashMap::new()),
            stats: Mutex::new(SearchStats::default()),
        }
    }

    /// Constructs the providers and installs the configured rate
    /// limits. Must be called before queries.
    pub fn initialize(&mut self) {
        for (provider, rule) in &self.config.rate_limits {
            self.limiter.set_provider_limit(provider, *rule);
        }

        let settings = |providers: &HashMap<String, ProviderSettings>, name: &str| {
            providers.get(name).cloned().unwrap_or_default()
        };

        let simbad = settings(&self.config.providers, "SIMBAD");
        let mut simbad_config = SimbadConfig::default();
        if let Some(timeout) = simbad.timeout {
            simbad_config.timeout = timeout;
        }
        if let Some(base_url) = simbad.base_url.clone() {
            simbad_config.base_url = base_url;
        }
        self.register(
            Arc::new(SimbadProvider::new(self.shared.clone(), simbad_config)),
            simbad.enabled,
        );

        let vizier = settings(&self.config.providers, "VizieR");
        let mut vizier_config = VizierConfig::default();
        if let Some(timeout) = vizier.timeout {
            vizier_config.timeout = timeout;
        }
        if let Some(base_url) = vizier.base_url.clone() {
            vizier_config.base_url = base_url;
        }
        self.register(
            Arc::new(VizierProvider::new(self.shared.clone(), vizier_config)),
            vizier.enabled,
        );

        let ned = settings(&self.config.providers, "NED");
        let mut ned_config = NedConfig::default();
        if let Some(timeout) = ned.timeout {
            ned_config.timeout = timeout;
        }
        if let Some(base_url) = ned.base_url.clone() {
            ned_config.base_url = base_url;
        }
        self.register(
            Arc::new(NedProvider::new(self.shared.clone(), ned_config)),
            ned.enabled,
        );

        let jpl = settings(&self.config.providers, "JPL_Horizons");
        let mut jpl_config = JplHorizonsConfig::default();
        if let Some(timeout) = jpl.timeout {
            jpl_config.timeout = timeout;
        }
        if let Some(base_url) = jpl.base_url.clone() {
            jpl_config.base_url = base_url;
        }
        self.register(
            Arc::new(JplHorizonsProvider::new(self.shared.clone(), jpl_config)),
            jpl.enabled,
        );

        let open_ngc = settings(&self.config.providers, "OpenNGC");
        let mut open_ngc_config = OpenNgcConfig::default();
        if let Some(timeout) = open_ngc.timeout {
            open_ngc_config.timeout = timeout;
        }
        if let Some(base_url) = open_ngc.base_url.clone() {
            open_ngc_config.data_url = base_url;
        }
        self.register(
            Arc::new(OpenNgcProvider::new(self.shared.clone(), open_ngc_config)),
            open_ngc.enabled,
        );

        info!("Search service initialized with {} providers", self.providers.len());
    }

    fn register(&mut self, provider: Arc<dyn CatalogProvider>, enabled: bool) {
        self.enabled
            .write()
            .unwrap()
            .insert(provider.name().to_string(), enabled);
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn is_initialized(&self) -> bool {
        !self.providers.is_empty()
    }

    // ---------- Provider management ----------

    pub fn available_providers(&self) -> Vec<String> {
        let enabled = self.enabled.read().unwrap();
        let mut names: Vec<String> = self
            .providers
            .keys()
            .filter(|name| enabled.get(*name).copied().unwrap_or(false))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_provider_available(&self, name: &str) -> bool {
        match self.providers.get(name) {
            Some(provider) => provider.is_available(),
            None => false,
        }
    }

    pub fn set_provider_enabled(&self, name: &str, enabled: bool) {
        self.enabled.write().unwrap().insert(name.to_string(), enabled);
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn CatalogProvider>> {
        self.providers.get(name).cloned()
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().unwrap().get(name).copied().unwrap_or(false)
    }

    // ---------- Queries ----------

    /// Queries one provider by name, retrying retryable errors up to
    /// the configured count within the per-query deadline.
    pub fn query_provider(
        &self,
        name: &str,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let provider = self.providers.get(name).ok_or_else(|| {
            QueryError::new(
                QueryErrorCode::InvalidQuery,
                name,
                "Unknown provider",
            )
        })?;
        if !self.is_enabled(name) {
            return Err(QueryError::new(
                QueryErrorCode::ServiceUnavailable,
                name,
                "Provider is disabled",
            ));
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let result = provider.query(request);
            let elapsed = started.elapsed();
            match result {
                Ok(result) => {
                    self.record_query(name, elapsed, true, result.from_cache);
                    return Ok(result);
                }
                Err(error) => {
                    let deadline_hit = elapsed >= self.config.query_timeout;
                    if !error.is_retryable() || attempt >= self.config.max_retries || deadline_hit
                    {
                        self.record_query(name, elapsed, false, false);
                        if deadline_hit && error.is_retryable() {
                            return Err(QueryError::new(
                                QueryErrorCode::Timeout,
                                name,
                                "Query deadline exceeded",
                            ));
                        }
                        return Err(error);
                    }
                    let delay = error.retry_after.unwrap_or(self.config.retry_delay);
                    debug!(
                        "Retrying {} after {:?} (attempt {}/{}): {}",
                        name, delay, attempt + 1, self.config.max_retries, error);
                    std::thread::sleep(delay.min(self.config.query_timeout));
                    attempt += 1;
                }
            }
        }
    }

    /// Fans the request out to every enabled provider supporting its
    /// kind, at most `max_concurrent_providers` in flight, bounded by
    /// `total_timeout`. Per-provider results, including errors, come
    /// back keyed by provider name.
    pub fn query_all(
        &self,
        request: &QueryRequest,
    ) -> Vec<(String, Result<QueryResult, QueryError>)> {
        let deadline = Instant::now() + self.config.total_timeout;
        let names: Vec<String> = self
            .available_providers()
            .into_iter()
            .filter(|name| {
                self.providers
                    .get(name)
                    .map(|p| p.supports_kind(request.kind))
                    .unwrap_or(false)
            })
            .collect();

        let mut results = vec![];
        let wave = self.config.max_concurrent_providers.max(1);
        for chunk in names.chunks(wave) {
            if Instant::now() >= deadline {
                for name in chunk {
                    results.push((
                        name.clone(),
                        Err(QueryError::new(
                            QueryErrorCode::Timeout,
                            name,
                            "Total fan-out deadline exceeded",
                        )),
                    ));
                }
                continue;
            }

            std::thread::scope(|scope| {
                let mut handles = vec![];
                for name in chunk {
                    let provider = self.providers.get(name).cloned();
                    handles.push((
                        name.clone(),
                        scope.spawn(move || match provider {
                            Some(provider) => provider.query(request),
                            None => Err(QueryError::new(
                                QueryErrorCode::Unknown,
                                name,
                                "Provider vanished during fan-out",
                            )),
                        }),
                    ));
                }
                for (name, handle) in handles {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(QueryError::new(
                            QueryErrorCode::Unknown,
                            &name,
                            "Provider worker panicked",
                        ))
                    });
                    let success = result.is_ok();
                    let from_cache = result.as_ref().map(|r| r.from_cache).unwrap_or(false);
                    self.record_query(&name, Duration::ZERO, success, from_cache);
                    results.push((name, result));
                }
            });
        }
        results
    }

    /// Picks the best provider for the request kind and falls back
    /// through the priority list when it fails with a retryable or
    /// service-side error. Parse and invalid-query errors indicate a
    /// caller bug and do not trigger fallback.
    pub fn query_auto(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        let preferred = self.preferred_provider(request);
        let mut order: Vec<String> = vec![];
        if let Some(name) = preferred {
            order.push(name);
        }
        if self.config.enable_fallback {
            for name in &self.config.provider_priority {
                if !order.contains(name) {
                    order.push(name.clone());
                }
            }
        }
        self.query_with_fallback(request, &order)
    }

    /// Tries providers in the supplied order, skipping ones that are
    /// unknown, disabled, or do not support the request kind.
    pub fn query_with_fallback(
        &self,
        request: &QueryRequest,
        providers: &[String],
    ) -> Result<QueryResult, QueryError> {
        let order: &[String] = if providers.is_empty() {
            &self.config.provider_priority
        } else {
            providers
        };

        let mut last_error: Option<QueryError> = None;
        for name in order {
            let provider = match self.providers.get(name) {
                Some(provider) => provider,
                None => continue,
            };
            if !self.is_enabled(name) || !provider.supports_kind(request.kind) {
                continue;
            }
            match self.query_provider(name, request) {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let fallback_worthy = matches!(
                        error.code,
                        QueryErrorCode::NetworkError
                            | QueryErrorCode::Timeout
                            | QueryErrorCode::RateLimited
                            | QueryErrorCode::ServiceUnavailable
                            | QueryErrorCode::NotFound
                            | QueryErrorCode::Unknown
                    );
                    if !fallback_worthy {
                        return Err(error);
                    }
                    warn!("Provider {} failed, falling back: {}", name, error);
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            QueryError::new(
                QueryErrorCode::ServiceUnavailable,
                "search_service",
                "No provider supports this query",
            )
        }))
    }

    /// Async variant of query_provider: the blocking query runs on a
    /// worker thread.
    pub async fn query_provider_async(
        self: Arc<Self>,
        name: &str,
        request: QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || self.query_provider(&name, &request))
            .await
            .unwrap_or_else(|e| {
                Err(QueryError::new(
                    QueryErrorCode::Unknown,
                    "search_service",
                    &format!("Worker join error: {}", e),
                ))
            })
    }

    /// Async variant of query_all: providers run as blocking tasks on
    /// worker threads, concurrency bounded by the same limit.
    pub async fn query_all_async(
        self: Arc<Self>,
        request: QueryRequest,
    ) -> Vec<(String, Result<QueryResult, QueryError>)> {
        let names: Vec<String> = self
            .available_providers()
            .into_iter()
            .filter(|name| {
                self.providers
                    .get(name)
                    .map(|p| p.supports_kind(request.kind))
                    .unwrap_or(false)
            })
            .collect();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.max_concurrent_providers.max(1),
        ));
        let tasks = names.into_iter().map(|name| {
            let service = self.clone();
            let request = request.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                let result = service.query_provider_async(&name, request).await;
                (name, result)
            }
        });
        futures::future::join_all(tasks).await
    }

    /// Async variant of query_auto.
    pub async fn query_auto_async(
        self: Arc<Self>,
        request: QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        tokio::task::spawn_blocking(move || self.query_auto(&request))
            .await
            .unwrap_or_else(|e| {
                Err(QueryError::new(
                    QueryErrorCode::Unknown,
                    "search_service",
                    &format!("Worker join error: {}", e),
                ))
            })
    }

    // ---------- Convenience wrappers ----------

    pub fn search_by_name(&self, name: &str, limit: usize) -> Vec<CelestialRecord> {
        let mut request = QueryRequest::by_name(name);
        request.limit = if limit == 0 { self.config.default_limit } else { limit };
        match self.query_auto(&request) {
            Ok(result) => result.records,
            Err(error) => {
                warn!("search_by_name({}) failed: {}", name, error);
                vec![]
            }
        }
    }

    pub fn search_by_coordinates(
        &self,
        ra_deg: f64,
        dec_deg: f64,
        radius_deg: f64,
        limit: usize,
    ) -> Vec<CelestialRecord> {
        let mut request = QueryRequest::cone_search(ra_deg, dec_deg, radius_deg);
        request.limit = if limit == 0 { self.config.default_limit } else { limit };
        match self.query_auto(&request) {
            Ok(result) => result.records,
            Err(error) => {
                warn!("search_by_coordinates failed: {}", error);
                vec![]
            }
        }
    }

    /// Point ephemeris for a solar system body via Horizons.
    pub fn get_ephemeris(
        &self,
        target: &str,
        time: chrono::DateTime<chrono::Utc>,
    ) -> Result<EphemerisPoint, QueryError> {
        let request = QueryRequest::ephemeris(target, time);
        let result = self.query_provider("JPL_Horizons", &request)?;
        result.ephemeris.into_iter().next().ok_or_else(|| {
            QueryError::new(
                QueryErrorCode::NotFound,
                "JPL_Horizons",
                &format!("No ephemeris point for {}", target),
            )
        })
    }

    /// Fans out, then merges all successful result sets under the
    /// default strategy.
    pub fn search_merged(&self, request: &QueryRequest) -> Vec<CelestialRecord> {
        let results: Vec<QueryResult> = self
            .query_all(request)
            .into_iter()
            .filter_map(|(_, result)| result.ok())
            .collect();
        self.merger.merge_multiple(&results)
    }

    pub fn merger(&self) -> &ResultMerger {
        &self.merger
    }

    // ---------- Cache and statistics ----------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn clear_provider_cache(&self, provider: &str) {
        self.cache.clear_provider(provider);
    }

    pub fn rate_limiter(&self) -> &Arc<ApiRateLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> SearchStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = SearchStats::default();
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn preferred_provider(&self, request: &QueryRequest) -> Option<String> {
        let term = request.term.trim().to_uppercase();
        let choice = match request.kind {
            QueryKind::Ephemeris => "JPL_Horizons",
            QueryKind::ByName => {
                if is_ngc_style_name(&term) {
                    "OpenNGC"
                } else {
                    "SIMBAD"
                }
            }
            QueryKind::ByCoordinates => "SIMBAD",
            QueryKind::Catalog => "VizieR",
            QueryKind::ByConstellation => "SIMBAD",
        };
        Some(choice.to_string())
    }

    fn record_query(&self, provider: &str, duration: Duration, success: bool, from_cache: bool) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_queries += 1;
        stats.total_query_time += duration;
        if from_cache {
            stats.cached_queries += 1;
        }
        if success {
            stats.successful_queries += 1;
        } else {
            stats.failed_queries += 1;
        }
        *stats
            .queries_per_provider
            .entry(provider.to_string())
            .or_insert(0) += 1;
        if stats.total_queries > 0 {
            stats.avg_query_time = stats.total_query_time / stats.total_queries as u32;
        }
        stats.last_query = Some(SystemTime::now());
    }
}

/// NGC/IC/Messier-style designations route to the local OpenNGC index.
fn is_ngc_style_name(term: &str) -> bool {
    for prefix in ["NGC", "IC", "M"] {
        if let Some(rest) = term.strip_prefix(prefix) {
            let rest = rest.trim();
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

// mod tests.
