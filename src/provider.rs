// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::http_client::{HttpClient, HttpResponse};
use crate::query::{QueryError, QueryErrorCode, QueryKind, QueryRequest, QueryResult};
use crate::query_cache::QueryCache;
use crate::rate_limiter::ApiRateLimiter;

/// A catalog service adapter. Implementations are thread-safe; the
/// search service shares them across its fan-out workers behind `Arc`.
///
/// `query` is blocking. The service offers async variants by
/// dispatching onto a worker thread, which keeps the adapters free of
/// executor concerns.
pub trait CatalogProvider: Send + Sync {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError>;

    /// Stable unique name, e.g. "SIMBAD".
    fn name(&self) -> &'static str;

    /// Lightweight health check against a well-known object. May block
    /// briefly.
    fn is_available(&self) -> bool;

    fn supported_kinds(&self) -> Vec<QueryKind>;

    fn base_url(&self) -> &str;

    fn supports_kind(&self, kind: QueryKind) -> bool {
        self.supported_kinds().contains(&kind)
    }
}

/// Async variant of the provider query: the blocking call dispatched
/// onto a worker thread. Available on any shared provider handle.
#[async_trait]
pub trait CatalogProviderAsync {
    async fn query_async(&self, request: QueryRequest) -> Result<QueryResult, QueryError>;
}

#[async_trait]
impl<P> CatalogProviderAsync for Arc<P>
where
    P: CatalogProvider + ?Sized + 'static,
{
    async fn query_async(&self, request: QueryRequest) -> Result<QueryResult, QueryError> {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || provider.query(&request))
            .await
            .unwrap_or_else(|e| {
                Err(QueryError::new(
                    QueryErrorCode::Unknown,
                    "provider",
                    &format!("Worker join error: {}", e),
                ))
            })
    }
}

/// Infrastructure shared by every provider: the HTTP wrapper, the
/// query cache, and the rate limiter. Cache and limiter are optional
/// so providers can run bare in tests.
#[derive(Clone)]
pub struct ProviderShared {
    pub http: Arc<HttpClient>,
    pub cache: Option<Arc<QueryCache>>,
    pub limiter: Option<Arc<ApiRateLimiter>>,
}

impl ProviderShared {
    pub fn new(
        http: Arc<HttpClient>,
        cache: Option<Arc<QueryCache>>,
        limiter: Option<Arc<ApiRateLimiter>>,
    ) -> Self {
        ProviderShared {
            http,
            cache,
            limiter,
        }
    }

    /// Cache lookup for (provider, request); hits come back tagged
    /// `from_cache`.
    pub fn cached(&self, provider: &str, request: &QueryRequest) -> Option<QueryResult> {
        let cache = self.cache.as_ref()?;
        let key = QueryCache::generate_fingerprint(provider, request);
        let mut result = cache.get(&key)?;
        result.from_cache = true;
        Some(result)
    }

    /// Local rate-limit admission. Short waits are slept out (this is
    /// the blocking path); waits longer than `max_wait` surface as a
    /// RateLimited error carrying the remaining delay.
    pub fn admit(&self, provider: &str, max_wait: Duration) -> Result<(), QueryError> {
        let limiter = match &self.limiter {
            Some(l) => l,
            None => return Ok(()),
        };
        loop {
            match limiter.try_acquire(provider) {
                None => return Ok(()),
                Some(wait) if wait <= max_wait => {
                    debug!("{} locally throttled, sleeping {:?}", provider, wait);
                    std::thread::sleep(wait);
                }
                Some(wait) => {
                    return Err(QueryError::rate_limited(provider, wait));
                }
            }
        }
    }

    /// Commits the request against the rate limiter; a 429 response
    /// additionally arms the server retry-after gate.
    pub fn complete(&self, provider: &str, success: bool) {
        if let Some(limiter) = &self.limiter {
            limiter.complete(provider, success);
        }
    }

    pub fn record_rate_limit_response(&self, provider: &str, retry_after: Duration) {
        if let Some(limiter) = &self.limiter {
            limiter.record_rate_limit_response(provider, retry_after);
        }
    }

    /// Stores a successful result under the provider's TTL.
    pub fn store(&self, provider: &str, request: &QueryRequest, result: &QueryResult) {
        if let Some(cache) = &self.cache {
            let key = QueryCache::generate_fingerprint(provider, request);
            let ttl = cache.ttl_for_provider(provider);
            cache.put(&key, result.clone(), Some(ttl));
        }
    }

    /// Maps a non-2xx HTTP status onto the typed error space. Returns
    /// None for 2xx. A 429 also arms the limiter's retry-after gate.
    pub fn map_status(&self, provider: &str, response: &HttpResponse) -> Option<QueryError> {
        let status = response.status;
        if (200..300).contains(&status) {
            return None;
        }
        let error = match status {
            429 => {
                let retry_after = response
                    .retry_after()
                    .unwrap_or(Duration::from_secs(60));
                self.record_rate_limit_response(provider, retry_after);
                QueryError::rate_limited(provider, retry_after)
            }
            401 | 403 => QueryError::new(
                QueryErrorCode::AuthenticationFailed,
                provider,
                &format!("HTTP {}", status),
            ),
            400..=499 => QueryError::new(
                QueryErrorCode::InvalidQuery,
                provider,
                &format!("HTTP {}", status),
            ),
            500..=599 => QueryError::new(
                QueryErrorCode::ServiceUnavailable,
                provider,
                &format!("HTTP {}", status),
            ),
            _ => QueryError::new(
                QueryErrorCode::Unknown,
                provider,
                &format!("HTTP {}", status),
            ),
        };
        Some(error.with_raw_response(&response.body))
    }
}

/// Percent-encodes a query-string component (RFC 3986 unreserved set
/// passes through).
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// mod tests.
