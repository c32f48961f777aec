// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

/// An outbound HTTP request. Timeout, redirect and TLS behavior are
/// per-call; user agent and proxy are wrapper-wide (HttpClientConfig).
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub verify_tls: bool,
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest {
            url: String::new(),
            method: "GET".to_string(),
            headers: vec![],
            body: None,
            timeout: Duration::from_secs(30),
            follow_redirects: true,
            verify_tls: true,
        }
    }
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        HttpRequest {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub response_time: Duration,

    /// Final URL after any redirects.
    pub effective_url: String,
}

impl HttpResponse {
    /// Value of the Retry-After header, when present as delta-seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub proxy_url: Option<String>,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub default_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            user_agent: "lodestar/0.1".to_string(),
            proxy_url: None,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// The transport seam. Production uses ReqwestTransport; tests inject
/// a scripted transport so nothing touches the network.
pub trait HttpTransport: Send + Sync {
    fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

/// Blocking reqwest transport. Clients are built lazily per
/// (verify_tls, follow_redirects) combination because both are
/// client-level settings in reqwest, then reused.
pub struct ReqwestTransport {
    config: HttpClientConfig,
    clients: Mutex<HashMap<(bool, bool), reqwest::blocking::Client>>,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> Self {
        ReqwestTransport {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(
        &self,
        verify_tls: bool,
        follow_redirects: bool,
    ) -> Result<reqwest::blocking::Client, String> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&(verify_tls, follow_redirects)) {
            return Ok(client.clone());
        }

        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(self.config.user_agent.clone())
            .danger_accept_invalid_certs(!verify_tls)
            .redirect(redirect)
            .timeout(self.config.default_timeout);
        if let Some(proxy_url) = &self.config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| format!("Invalid proxy URL: {}", e))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| format!("Error building HTTP client: {}", e))?;
        clients.insert((verify_tls, follow_redirects), client.clone());
        Ok(client)
    }
}

impl HttpTransport for ReqwestTransport {
    fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        let client = self.client(request.verify_tls, request.follow_redirects)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("Invalid HTTP method {:?}: {}", request.method, e))?;

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let response = builder.send().map_err(|e| e.to_string())?;

        let status = response.status().as_u16();
        let effective_url = response.url().to_string();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), text.to_string());
            }
        }
        let body = response.text().map_err(|e| e.to_string())?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            response_time: start.elapsed(),
            effective_url,
        })
    }
}

/// HTTP wrapper with retry. Network errors and the transient status
/// codes {408, 429, 500, 502, 503, 504} are retried up to
/// `max_retries` times with exponential backoff (base * 2^attempt).
/// A Retry-After header on a retried response overrides the computed
/// backoff. Other statuses are returned to the caller as-is.
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    config: HttpClientConfig,
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.clone()));
        HttpClient { transport, config }
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, config: HttpClientConfig) -> Self {
        HttpClient { transport, config }
    }

    pub fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            match self.transport.perform(request) {
                Ok(response) => {
                    if !is_retryable_status(response.status) {
                        return Ok(response);
                    }
                    if attempt == self.config.max_retries {
                        return Ok(response);
                    }
                    let delay = response
                        .retry_after()
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    warn!(
                        "HTTP {} from {}, retrying in {:?} (attempt {}/{})",
                        response.status, request.url, delay, attempt + 1,
                        self.config.max_retries);
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    last_error = e;
                    if attempt == self.config.max_retries {
                        break;
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "HTTP request to {} failed ({}), retrying in {:?} \
                         (attempt {}/{})",
                        request.url, last_error, delay, attempt + 1,
                        self.config.max_retries);
                    std::thread::sleep(delay);
                }
            }
        }
        debug!("HTTP request to {} exhausted retries", request.url);
        Err(format!(
            "HTTP request failed after {} attempts: {}",
            self.config.max_retries + 1,
            last_error
        ))
    }

    pub fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, String> {
        self.perform(&HttpRequest {
            url: url.to_string(),
            timeout,
            ..Default::default()
        })
    }

    pub fn post(
        &self,
        url: &str,
        body: &str,
        content_type: &str,
    ) -> Result<HttpResponse, String> {
        self.perform(&HttpRequest {
            url: url.to_string(),
            method: "POST".to_string(),
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: Some(body.to_string()),
            timeout: self.config.default_timeout,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        self.config.retry_base_delay * (1u32 << attempt.min(16))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport for tests: pops canned outcomes in order and
    /// records every request it sees.
    pub struct ScriptedTransport {
        responses: Mutex<Vec<Result<HttpResponse, String>>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(mut responses: Vec<Result<HttpResponse, String>>) -> Self {
            responses.reverse();  // Pop from the back in fifo order.
            ScriptedTransport {
                responses: Mutex::new(responses),
                requests: Mutex::new(vec![]),
            }
        }

        pub fn ok(status: u16, body: &str) -> Result<HttpResponse, String> {
            Ok(HttpResponse {
                status,
                body: body.to_string(),
                ..Default::default()
            })
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err("ScriptedTransport exhausted".to_string()))
        }
    }
}

// mod tests.
