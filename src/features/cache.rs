//! Client-side HTTP cache.
//!
//! Entries are stored per URL and per combination of the request header
//! values named by the response's `Vary` header. A fresh entry answers the
//! request without any exchange. A stale one (or one marked `no-cache`) is
//! revalidated with `If-None-Match` / `If-Modified-Since`, and a `304`
//! answer is replaced by the cached response.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::header::{CACHE_CONTROL, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, VARY};
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::attributes::AttributeKey;
use crate::body::{OutgoingContent, ResponseBody};
use crate::call::HttpClientCall;
use crate::error::Result;
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpReceivePhase, HttpSendPhase, ReceiveContext, RequestContext};
use crate::request::HttpRequest;
use crate::response::{HttpResponse, HttpResponseData};

/// One cached response
#[derive(Debug, Clone)]
pub struct HttpCacheEntry {
    expires: DateTime<Utc>,
    vary_keys: BTreeMap<String, String>,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    request_time: DateTime<Utc>,
    response_time: DateTime<Utc>,
}

impl HttpCacheEntry {
    /// Get the time the entry becomes stale
    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    /// Get the request header values the entry was stored for
    pub fn vary_keys(&self) -> &BTreeMap<String, String> {
        &self.vary_keys
    }

    /// Get the cached status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the cached headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the cached body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Check whether the entry expired at `now`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }

    /// Check whether the entry must be revalidated before use
    pub fn should_validate(&self, now: DateTime<Utc>) -> bool {
        self.is_stale(now) || cache_control(&self.headers).iter().any(|d| d == "no-cache")
    }

    fn matches(&self, request_headers: &HeaderMap) -> bool {
        self.vary_keys
            .iter()
            .all(|(name, value)| header_text(request_headers, name) == *value)
    }

    fn refreshed(&self, expires: DateTime<Utc>, vary_keys: BTreeMap<String, String>) -> Self {
        Self {
            expires,
            vary_keys,
            ..self.clone()
        }
    }

    fn to_response_data(&self) -> HttpResponseData {
        HttpResponseData::new(
            self.status,
            self.version,
            self.headers.clone(),
            ResponseBody::Bytes(self.body.clone()),
            self.request_time,
        )
    }
}

/// Storage of cache entries
pub trait HttpCacheStorage: Send + Sync {
    /// Store `entry`, replacing an entry with the same vary keys
    fn store(&self, url: &Url, entry: HttpCacheEntry);

    /// Find the entry stored for exactly `vary_keys`
    fn find(&self, url: &Url, vary_keys: &BTreeMap<String, String>) -> Option<HttpCacheEntry>;

    /// Get every entry stored for `url`
    fn find_by_url(&self, url: &Url) -> Vec<HttpCacheEntry>;
}

/// In-memory storage without any size bound
#[derive(Debug, Default)]
pub struct UnlimitedCacheStorage {
    entries: Mutex<HashMap<Url, Vec<HttpCacheEntry>>>,
}

impl UnlimitedCacheStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Check if the storage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HttpCacheStorage for UnlimitedCacheStorage {
    fn store(&self, url: &Url, entry: HttpCacheEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            let slot = entries.entry(url.clone()).or_default();
            slot.retain(|existing| existing.vary_keys != entry.vary_keys);
            slot.push(entry);
        }
    }

    fn find(&self, url: &Url, vary_keys: &BTreeMap<String, String>) -> Option<HttpCacheEntry> {
        let entries = self.entries.lock().ok()?;
        let found = entries
            .get(url)?
            .iter()
            .find(|entry| &entry.vary_keys == vary_keys)
            .cloned();
        found
    }

    fn find_by_url(&self, url: &Url) -> Vec<HttpCacheEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(url).cloned())
            .unwrap_or_default()
    }
}

/// Storage that never keeps anything
#[derive(Debug, Default)]
pub struct DisabledCacheStorage;

impl HttpCacheStorage for DisabledCacheStorage {
    fn store(&self, _url: &Url, _entry: HttpCacheEntry) {}

    fn find(&self, _url: &Url, _vary_keys: &BTreeMap<String, String>) -> Option<HttpCacheEntry> {
        None
    }

    fn find_by_url(&self, _url: &Url) -> Vec<HttpCacheEntry> {
        Vec::new()
    }
}

/// Configuration for [`HttpCache`]
pub struct HttpCacheConfig {
    /// Storage for responses any cache may keep
    pub public_storage: Arc<dyn HttpCacheStorage>,
    /// Storage for responses marked `private`
    pub private_storage: Arc<dyn HttpCacheStorage>,
    /// Behave as a shared cache, honoring `s-maxage`
    pub shared: bool,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            public_storage: Arc::new(UnlimitedCacheStorage::new()),
            private_storage: Arc::new(UnlimitedCacheStorage::new()),
            shared: false,
        }
    }
}

/// HTTP cache feature
pub struct HttpCache {
    public_storage: Arc<dyn HttpCacheStorage>,
    private_storage: Arc<dyn HttpCacheStorage>,
    shared: bool,
}

impl HttpCache {
    /// Get the public storage
    pub fn public_storage(&self) -> &Arc<dyn HttpCacheStorage> {
        &self.public_storage
    }

    /// Get the private storage
    pub fn private_storage(&self) -> &Arc<dyn HttpCacheStorage> {
        &self.private_storage
    }

    fn find(&self, url: &Url, request_headers: &HeaderMap) -> Option<HttpCacheEntry> {
        self.private_storage
            .find_by_url(url)
            .into_iter()
            .chain(self.public_storage.find_by_url(url))
            .find(|entry| entry.matches(request_headers))
    }

    fn storage_for(&self, headers: &HeaderMap) -> &Arc<dyn HttpCacheStorage> {
        if cache_control(headers).iter().any(|d| d == "private") {
            &self.private_storage
        } else {
            &self.public_storage
        }
    }

    fn expires(&self, response: &HttpResponse) -> DateTime<Utc> {
        let directives = cache_control(response.headers());
        let max_age = |name: &str| {
            directives
                .iter()
                .find_map(|d| d.strip_prefix(name)?.strip_prefix('=')?.trim_matches('"').parse::<i64>().ok())
        };
        let seconds = if self.shared {
            max_age("s-maxage").or_else(|| max_age("max-age"))
        } else {
            max_age("max-age")
        };

        if let Some(seconds) = seconds {
            return response.request_time() + ChronoDuration::seconds(seconds);
        }
        response
            .headers()
            .get(EXPIRES)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|expires| expires.with_timezone(&Utc))
            .unwrap_or_else(|| response.response_time())
    }
}

impl std::fmt::Debug for HttpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCache").field("shared", &self.shared).finish()
    }
}

impl HttpClientFeature for HttpCache {
    type Config = HttpCacheConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpCache");

    fn prepare(config: HttpCacheConfig) -> Result<Self> {
        Ok(Self {
            public_storage: config.public_storage,
            private_storage: config.private_storage,
            shared: config.shared,
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup.send_pipeline().intercept(
            HttpSendPhase::STATE,
            CacheLookup {
                feature: feature.clone(),
            },
        )?;
        setup
            .receive_pipeline()
            .intercept(HttpReceivePhase::STATE, CacheStore { feature })
    }
}

fn is_cacheable_request(method: &Method, body: &OutgoingContent) -> bool {
    (*method == Method::GET || *method == Method::HEAD) && body.is_empty()
}

fn cache_control(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .filter(|directive| !directive.is_empty())
        .collect()
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn vary_keys(response_headers: &HeaderMap, request_headers: &HeaderMap) -> BTreeMap<String, String> {
    response_headers
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty() && name != "*")
        .map(|name| {
            let value = header_text(request_headers, &name);
            (name, value)
        })
        .collect()
}

/// Answers from the cache or adds validation headers
struct CacheLookup {
    feature: Arc<HttpCache>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for CacheLookup {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let context = ctx.context_mut();
        if !is_cacheable_request(context.request.method(), context.request.body()) {
            return Ok(());
        }
        let entry = match self.feature.find(context.request.url(), context.request.headers()) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        if !entry.should_validate(Utc::now()) {
            tracing::debug!(url = %context.request.url(), "serving response from cache");
            let scope = context.execution.child();
            let url = context.request.url().clone();
            let response = HttpResponse::new(entry.to_response_data(), url, scope);
            context.call = Some(HttpClientCall::new(HttpRequest::from(&context.request), response));
            ctx.finish();
            return Ok(());
        }

        let headers = context.request.headers_mut();
        if let Some(etag) = entry.headers.get(ETAG) {
            headers.insert(IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = entry.headers.get(LAST_MODIFIED) {
            headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "CacheLookup"
    }
}

/// Stores cacheable responses and resolves `304 Not Modified`
struct CacheStore {
    feature: Arc<HttpCache>,
}

#[async_trait]
impl Interceptor<HttpResponse, ReceiveContext> for CacheStore {
    async fn intercept(&self, ctx: &mut PipelineContext<HttpResponse, ReceiveContext>) -> Result<()> {
        let request = ctx.context().request.clone();
        if !is_cacheable_request(request.method(), request.content()) {
            return Ok(());
        }
        let status = ctx.subject().status();

        if status == StatusCode::NOT_MODIFIED {
            let cached = match self.feature.find(request.url(), request.headers()) {
                Some(cached) => cached,
                None => return Ok(()),
            };
            let response = ctx.subject();
            let refreshed = cached.refreshed(
                self.feature.expires(response),
                vary_keys(&cached.headers, request.headers()),
            );
            let replacement = HttpResponse::new(
                refreshed.to_response_data(),
                response.url().clone(),
                response.scope().clone(),
            );
            self.feature
                .storage_for(&refreshed.headers)
                .store(request.url(), refreshed);
            tracing::debug!(url = %request.url(), "response not modified, using cached body");
            ctx.set_subject(replacement);
            return Ok(());
        }

        if !status.is_success() || cache_control(ctx.subject().headers()).iter().any(|d| d == "no-store") {
            return Ok(());
        }

        let response = ctx.subject_mut();
        let body = response.take_body()?.collect().await?;
        response.set_body(ResponseBody::Bytes(body.clone()));

        let entry = HttpCacheEntry {
            expires: self.feature.expires(response),
            vary_keys: vary_keys(response.headers(), request.headers()),
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            body,
            request_time: response.request_time(),
            response_time: response.response_time(),
        };
        self.feature
            .storage_for(response.headers())
            .store(request.url(), entry);
        Ok(())
    }

    fn name(&self) -> &str {
        "CacheStore"
    }
}
