// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use chrono::DurationRound;
use log::{debug, info};

use crate::query::{QueryKind, QueryRequest, QueryResult};

/// Cache sizing and per-provider TTL policy. The per-provider values
/// reflect how quickly each service's data goes stale: deep-sky
/// catalogs barely change, ephemerides are perishable.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,

    pub simbad_ttl: Duration,
    pub vizier_ttl: Duration,
    pub ned_ttl: Duration,
    pub jpl_horizons_ttl: Duration,
    pub open_ngc_ttl: Duration,
}

const MINUTE: Duration = Duration::from_secs(60);

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 1000,
            default_ttl: 60 * MINUTE,
            simbad_ttl: 120 * MINUTE,
            vizier_ttl: 120 * MINUTE,
            ned_ttl: 60 * MINUTE,
            jpl_horizons_ttl: 5 * MINUTE,
            open_ngc_ttl: 1440 * MINUTE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub last_cleanup: Option<SystemTime>,
}

struct CacheEntry {
    result: QueryResult,
    inserted_at: Instant,
    ttl: Duration,

    // Monotonic access stamp for LRU eviction.
    last_access: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    access_tick: u64,
    hits: u64,
    misses: u64,
    last_cleanup: Option<SystemTime>,
}

/// Bounded fingerprint -> result cache with TTL expiry and LRU
/// eviction. Safe for concurrent readers and writers; a single
/// reader/writer lock guards the whole map, which is plenty at
/// catalog-query rates.
pub struct QueryCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        QueryCache {
            config,
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                access_tick: 0,
                hits: 0,
                misses: 0,
                last_cleanup: None,
            }),
        }
    }

    /// Returns the cached result for `fingerprint` if present and
    /// inside its TTL. Expired entries are evicted on the spot.
    pub fn get(&self, fingerprint: &str) -> Option<QueryResult> {
        enum Lookup {
            Miss,
            Expired,
            Hit(QueryResult),
        }

        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();
        inner.access_tick += 1;
        let tick = inner.access_tick;

        let lookup = match inner.map.get_mut(fingerprint) {
            None => Lookup::Miss,
            Some(entry) => {
                if entry.is_expired(now) {
                    Lookup::Expired
                } else {
                    entry.last_access = tick;
                    Lookup::Hit(entry.result.clone())
                }
            }
        };

        match lookup {
            Lookup::Hit(result) => {
                inner.hits += 1;
                debug!("Cache hit for {}", fingerprint);
                Some(result)
            }
            Lookup::Expired => {
                inner.map.remove(fingerprint);
                inner.last_cleanup = Some(SystemTime::now());
                inner.misses += 1;
                debug!("Cache miss (expired) for {}", fingerprint);
                None
            }
            Lookup::Miss => {
                inner.misses += 1;
                debug!("Cache miss for {}", fingerprint);
                None
            }
        }
    }

    /// Stores a result under `fingerprint`. `ttl` overrides the
    /// default when given (providers pass their per-service TTL).
    /// Evicts expired entries first, then least-recently-used entries
    /// until the configured capacity holds.
    pub fn put(&self, fingerprint: &str, result: QueryResult, ttl: Option<Duration>) {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();
        inner.access_tick += 1;
        let tick = inner.access_tick;

        let before = inner.map.len();
        inner.map.retain(|_, entry| !entry.is_expired(now));
        if inner.map.len() != before {
            inner.last_cleanup = Some(SystemTime::now());
        }

        while inner.map.len() >= self.config.max_entries.max(1)
            && !inner.map.contains_key(fingerprint)
        {
            let victim = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    debug!("Evicting LRU cache entry {}", key);
                    inner.map.remove(&key);
                }
                None => break,
            }
        }

        inner.map.insert(
            fingerprint.to_string(),
            CacheEntry {
                result,
                inserted_at: now,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                last_access: tick,
            },
        );
    }

    /// True lookup: the key is present and not expired. Does not touch
    /// LRU order or hit/miss counters.
    pub fn contains(&self, fingerprint: &str) -> bool {
        let inner = self.inner.read().unwrap();
        let now = Instant::now();
        inner
            .map
            .get(fingerprint)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    pub fn remove(&self, fingerprint: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.map.remove(fingerprint);
    }

    pub fn clear(&self) {
        info!("Clearing all cache entries");
        let mut inner = self.inner.write().unwrap();
        inner.map.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Drops every entry belonging to `provider`. Fingerprints are
    /// prefixed with the provider name, so this is a prefix sweep.
    pub fn clear_provider(&self, provider: &str) {
        info!("Clearing cache entries for {}", provider);
        let prefix = format!("{}:", provider);
        let mut inner = self.inner.write().unwrap();
        inner.map.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
            last_cleanup: inner.last_cleanup,
        }
    }

    pub fn ttl_for_provider(&self, provider: &str) -> Duration {
        match provider {
            "SIMBAD" => self.config.simbad_ttl,
            "VizieR" => self.config.vizier_ttl,
            "NED" => self.config.ned_ttl,
            "JPL_Horizons" => self.config.jpl_horizons_ttl,
            "OpenNGC" => self.config.open_ngc_ttl,
            _ => self.config.default_ttl,
        }
    }

    /// Builds the stable cache key for (provider, request). Numeric
    /// fields are rounded to fixed precisions (coordinates 4dp, radius
    /// 2dp, ephemeris epoch to the minute) so requests that differ
    /// only by float noise share an entry.
    pub fn generate_fingerprint(provider: &str, request: &QueryRequest) -> String {
        let mut key = format!("{}:{}:{}", provider, request.kind.as_str(), request.term);

        if let (Some(ra), Some(dec)) = (request.ra_deg, request.dec_deg) {
            key.push_str(&format!(":{:.4}:{:.4}", ra, dec));
            if let Some(radius) = request.radius_deg {
                key.push_str(&format!(":{:.2}", radius));
            }
        }
        if let Some(catalog) = &request.catalog {
            key.push_str(&format!(":{}", catalog));
        }
        if let Some(min) = request.min_magnitude {
            key.push_str(&format!(":min{:.2}", min));
        }
        if let Some(max) = request.max_magnitude {
            key.push_str(&format!(":max{:.2}", max));
        }
        if request.kind == QueryKind::Ephemeris {
            let epoch = request
                .epoch
                .duration_trunc(chrono::Duration::minutes(1))
                .unwrap_or(request.epoch);
            key.push_str(&format!(":{}", epoch.format("%Y-%m-%dT%H:%M")));
        }

        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_for(provider: &str) -> QueryResult {
        QueryResult {
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    fn small_cache(max_entries: usize) -> QueryCache {
        QueryCache::new(CacheConfig {
            max_entries,
            ..Default::default()
        })
    }

    #[test]
    fn test_get_after_put_within_ttl() {
        let cache = small_cache(10);
        cache.put("k", result_for("SIMBAD"), Some(Duration::from_secs(60)));
        let hit = cache.get("k").expect("entry should be live");
        assert_eq!(hit.provider, "SIMBAD");
        assert!(cache.contains("k"));
    }

    #[test]
    fn test_expiry() {
        let cache = small_cache(10);
        cache.put("k", result_for("SIMBAD"), Some(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.contains("k"));
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = small_cache(2);
        cache.put("a", result_for("A"), None);
        cache.put("b", result_for("B"), None);
        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").is_some());
        cache.put("c", result_for("C"), None);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_hit_rate() {
        let cache = small_cache(10);
        cache.put("k", result_for("SIMBAD"), None);
        assert!(cache.get("k").is_some());
        assert!(cache.get("missing").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_clear_provider_prefix() {
        let cache = small_cache(10);
        let req = QueryRequest::by_name("M31");
        let simbad_key = QueryCache::generate_fingerprint("SIMBAD", &req);
        let ned_key = QueryCache::generate_fingerprint("NED", &req);
        cache.put(&simbad_key, result_for("SIMBAD"), None);
        cache.put(&ned_key, result_for("NED"), None);

        cache.clear_provider("SIMBAD");
        assert!(!cache.contains(&simbad_key));
        assert!(cache.contains(&ned_key));
    }

    #[test]
    fn test_fingerprint_rounds_float_noise() {
        let a = QueryRequest::cone_search(10.68470004, 41.26890001, 0.5);
        let b = QueryRequest::cone_search(10.68469996, 41.26889999, 0.5004);
        assert_eq!(
            QueryCache::generate_fingerprint("SIMBAD", &a),
            QueryCache::generate_fingerprint("SIMBAD", &b)
        );

        // A genuinely different position must not collide.
        let c = QueryRequest::cone_search(10.6851, 41.2689, 0.5);
        assert_ne!(
            QueryCache::generate_fingerprint("SIMBAD", &a),
            QueryCache::generate_fingerprint("SIMBAD", &c)
        );
    }

    #[test]
    fn test_fingerprint_ephemeris_epoch_rounding() {
        use chrono::TimeZone;
        let t0 = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 5).unwrap();
        let t1 = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 55).unwrap();
        let t2 = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 31, 5).unwrap();
        let a = QueryRequest::ephemeris("Mars", t0);
        let b = QueryRequest::ephemeris("Mars", t1);
        let c = QueryRequest::ephemeris("Mars", t2);
        let fp = |r| QueryCache::generate_fingerprint("JPL_Horizons", r);
        assert_eq!(fp(&a), fp(&b));
        assert_ne!(fp(&a), fp(&c));
    }

    #[test]
    fn test_ttl_for_provider() {
        let cache = QueryCache::new(CacheConfig::default());
        assert_eq!(cache.ttl_for_provider("SIMBAD"), 120 * MINUTE);
        assert_eq!(cache.ttl_for_provider("JPL_Horizons"), 5 * MINUTE);
        assert_eq!(cache.ttl_for_provider("nobody"), 60 * MINUTE);
    }

}  // mod tests.
