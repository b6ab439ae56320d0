//! Cookie persistence across requests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use cookie::Cookie;
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderValue;
use tokio::sync::OnceCell;
use url::Url;

use crate::attributes::AttributeKey;
use crate::body::OutgoingContent;
use crate::error::Result;
use crate::feature::{ClientSetup, HttpClientFeature};
use crate::pipeline::{Interceptor, PipelineContext};
use crate::pipelines::{HttpReceivePhase, HttpRequestPhase, HttpSendPhase, ReceiveContext, RequestContext};
use crate::response::HttpResponse;

/// Cookie header the caller set explicitly, kept across resends
const INITIAL_COOKIES: AttributeKey<String> = AttributeKey::new("InitialCookies");

/// Storage of cookies received from servers
#[async_trait]
pub trait CookiesStorage: Send + Sync {
    /// Cookies that should be sent to `url`
    async fn get(&self, url: &Url) -> Vec<Cookie<'static>>;

    /// Store a cookie received from `url`
    async fn add_cookie(&self, url: &Url, cookie: Cookie<'static>);

    /// Release the storage
    async fn close(&self) {}
}

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie<'static>,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires_at: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    fn matches(&self, host: &str, path: &str, secure: bool) -> bool {
        domain_matches(host, &self.domain, self.host_only) && path_matches(path, &self.path) && (!self.secure || secure)
    }

    fn same_identity(&self, other: &StoredCookie) -> bool {
        self.cookie.name() == other.cookie.name() && self.domain == other.domain && self.path == other.path
    }
}

/// In-memory storage accepting every cookie
#[derive(Debug, Default)]
pub struct AcceptAllCookiesStorage {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl AcceptAllCookiesStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored cookies, expired ones included
    pub fn len(&self) -> usize {
        self.cookies.lock().map(|cookies| cookies.len()).unwrap_or(0)
    }

    /// Check if the storage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, url: &Url, cookie: Cookie<'static>, now: SystemTime) {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return,
        };
        let (domain, host_only) = match cookie.domain() {
            Some(domain) if !domain.trim_start_matches('.').is_empty() => {
                (domain.trim_start_matches('.').to_ascii_lowercase(), false)
            }
            _ => (host, true),
        };
        let path = match cookie.path() {
            Some(path) if path.starts_with('/') => path.to_string(),
            _ => "/".to_string(),
        };

        let removal;
        let expires_at = match cookie.max_age() {
            Some(max_age) => {
                let seconds = max_age.whole_seconds();
                removal = seconds <= 0;
                Some(now + Duration::from_secs(seconds.max(0) as u64))
            }
            None => match cookie.expires_datetime() {
                Some(expires) => {
                    let expires = SystemTime::from(expires);
                    removal = expires <= now;
                    Some(expires)
                }
                None => {
                    removal = false;
                    None
                }
            },
        };

        let stored = StoredCookie {
            secure: cookie.secure().unwrap_or(false),
            cookie,
            domain,
            host_only,
            path,
            expires_at,
        };

        if let Ok(mut cookies) = self.cookies.lock() {
            cookies.retain(|existing| !existing.same_identity(&stored));
            if removal {
                tracing::trace!(name = stored.cookie.name(), "cookie expired on arrival");
            } else {
                cookies.push(stored);
            }
        }
    }

    fn lookup(&self, url: &Url, now: SystemTime) -> Vec<Cookie<'static>> {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return Vec::new(),
        };
        let secure = url.scheme() == "https";

        match self.cookies.lock() {
            Ok(mut cookies) => {
                cookies.retain(|stored| !stored.is_expired(now));
                cookies
                    .iter()
                    .filter(|stored| stored.matches(&host, url.path(), secure))
                    .map(|stored| stored.cookie.clone())
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl CookiesStorage for AcceptAllCookiesStorage {
    async fn get(&self, url: &Url) -> Vec<Cookie<'static>> {
        self.lookup(url, SystemTime::now())
    }

    async fn add_cookie(&self, url: &Url, cookie: Cookie<'static>) {
        self.store(url, cookie, SystemTime::now());
    }

    async fn close(&self) {
        if let Ok(mut cookies) = self.cookies.lock() {
            cookies.clear();
        }
    }
}

/// Check whether `host` falls under a cookie `domain`
///
/// A host-only cookie matches its exact host. Otherwise the domain also
/// matches every subdomain, never a host that merely ends with the same
/// characters.
pub fn domain_matches(host: &str, domain: &str, host_only: bool) -> bool {
    let domain = domain.trim_start_matches('.');
    if host.eq_ignore_ascii_case(domain) {
        return true;
    }
    !host_only
        && host.len() > domain.len()
        && host[host.len() - domain.len()..].eq_ignore_ascii_case(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// Check whether `request_path` falls under a cookie `path`
pub fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Render cookies as a `Cookie` header value
pub fn render_cookie_header(cookies: &[Cookie<'_>]) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration for [`HttpCookies`]
#[derive(Default)]
pub struct HttpCookiesConfig {
    /// Storage to use, an [`AcceptAllCookiesStorage`] when unset
    pub storage: Option<Arc<dyn CookiesStorage>>,
    /// Cookies added to the storage before the first request
    pub default_cookies: Vec<(Url, Cookie<'static>)>,
}

impl HttpCookiesConfig {
    /// Add a cookie stored before the first request
    pub fn default_cookie(&mut self, url: Url, cookie: Cookie<'static>) -> &mut Self {
        self.default_cookies.push((url, cookie));
        self
    }
}

/// Cookie feature
///
/// Sends stored cookies with every physical send, redirects included, and
/// stores every `Set-Cookie` of every response.
pub struct HttpCookies {
    storage: Arc<dyn CookiesStorage>,
    defaults: Vec<(Url, Cookie<'static>)>,
    initialized: OnceCell<()>,
}

impl HttpCookies {
    /// Cookies that would be sent to `url`
    pub async fn get(&self, url: &Url) -> Vec<Cookie<'static>> {
        self.initialize().await;
        self.storage.get(url).await
    }

    /// Close the storage
    pub async fn close(&self) {
        self.storage.close().await;
    }

    async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                for (url, cookie) in &self.defaults {
                    self.storage.add_cookie(url, cookie.clone()).await;
                }
            })
            .await;
    }
}

impl std::fmt::Debug for HttpCookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCookies")
            .field("defaults", &self.defaults.len())
            .field("initialized", &self.initialized.initialized())
            .finish()
    }
}

impl HttpClientFeature for HttpCookies {
    type Config = HttpCookiesConfig;
    const KEY: AttributeKey<Self> = AttributeKey::new("HttpCookies");

    fn prepare(config: HttpCookiesConfig) -> Result<Self> {
        Ok(Self {
            storage: config
                .storage
                .unwrap_or_else(|| Arc::new(AcceptAllCookiesStorage::new())),
            defaults: config.default_cookies,
            initialized: OnceCell::new(),
        })
    }

    fn install(feature: Arc<Self>, setup: &mut ClientSetup) -> Result<()> {
        setup
            .request_pipeline()
            .intercept(HttpRequestPhase::STATE, CaptureHeaderCookies)?;
        setup.send_pipeline().intercept(
            HttpSendPhase::STATE,
            RenderCookies {
                feature: feature.clone(),
            },
        )?;
        setup
            .receive_pipeline()
            .intercept(HttpReceivePhase::STATE, StoreCookies { feature })
    }
}

struct CaptureHeaderCookies;

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for CaptureHeaderCookies {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let request = &mut ctx.context_mut().request;
        let initial = match request.headers().get(COOKIE) {
            Some(value) => value.to_str()?.to_string(),
            None => return Ok(()),
        };
        request.attributes_mut().put(INITIAL_COOKIES, initial);
        Ok(())
    }

    fn name(&self) -> &str {
        "CaptureHeaderCookies"
    }
}

struct RenderCookies {
    feature: Arc<HttpCookies>,
}

#[async_trait]
impl Interceptor<OutgoingContent, RequestContext> for RenderCookies {
    async fn intercept(&self, ctx: &mut PipelineContext<OutgoingContent, RequestContext>) -> Result<()> {
        let url = ctx.context().request.url().clone();
        let stored = self.feature.get(&url).await;

        let request = &mut ctx.context_mut().request;
        let mut parts = Vec::with_capacity(2);
        if let Some(initial) = request.attributes().get(INITIAL_COOKIES) {
            parts.push(initial.clone());
        }
        if !stored.is_empty() {
            parts.push(render_cookie_header(&stored));
        }

        if parts.is_empty() {
            request.headers_mut().remove(COOKIE);
        } else {
            request
                .headers_mut()
                .insert(COOKIE, HeaderValue::from_str(&parts.join("; "))?);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "RenderCookies"
    }
}

struct StoreCookies {
    feature: Arc<HttpCookies>,
}

#[async_trait]
impl Interceptor<HttpResponse, ReceiveContext> for StoreCookies {
    async fn intercept(&self, ctx: &mut PipelineContext<HttpResponse, ReceiveContext>) -> Result<()> {
        let url = ctx.context().request.url().clone();
        let received: Vec<Cookie<'static>> = ctx
            .subject()
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| match Cookie::parse(value.to_string()) {
                Ok(cookie) => Some(cookie),
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "ignoring malformed Set-Cookie header");
                    None
                }
            })
            .collect();

        if received.is_empty() {
            return Ok(());
        }
        self.feature.initialize().await;
        for cookie in received {
            self.feature.storage.add_cookie(&url, cookie).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "StoreCookies"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::engine::mock::{headers_of, respond, respond_ok};
    use crate::engine::{MockEngine, MockEngineConfig};
    use http::StatusCode;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    fn names(cookies: &[Cookie<'static>]) -> Vec<String> {
        let mut names: Vec<String> = cookies.iter().map(|c| c.name().to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_domain_matching() {
        assert!(domain_matches("example.com", ".example.com", false));
        assert!(domain_matches("www.example.com", "example.com", false));
        assert!(domain_matches("a.b.example.com", ".example.com", false));
        assert!(!domain_matches("otherexample.com", "example.com", false));
        assert!(!domain_matches("www.example.com", "example.com", true));
        assert!(domain_matches("EXAMPLE.com", "example.com", true));
    }

    #[test]
    fn test_path_matching() {
        assert!(path_matches("/", "/"));
        assert!(path_matches("/docs/a", "/docs"));
        assert!(path_matches("/docs/a", "/docs/"));
        assert!(!path_matches("/docsearch", "/docs"));
        assert!(!path_matches("/", "/docs"));
    }

    #[tokio::test]
    async fn test_wildcard_domain_cookie() {
        let storage = AcceptAllCookiesStorage::new();
        storage
            .add_cookie(&url("http://www.example.com/"), Cookie::parse("a=1; Domain=.example.com").unwrap())
            .await;

        assert_eq!(names(&storage.get(&url("http://example.com/")).await), vec!["a"]);
        assert_eq!(names(&storage.get(&url("http://api.example.com/x")).await), vec!["a"]);
        assert!(storage.get(&url("http://otherexample.com/")).await.is_empty());
    }

    #[tokio::test]
    async fn test_host_only_and_secure_cookies() {
        let storage = AcceptAllCookiesStorage::new();
        let origin = url("https://example.com/");
        storage.add_cookie(&origin, Cookie::parse("host=1").unwrap()).await;
        storage.add_cookie(&origin, Cookie::parse("sec=1; Secure").unwrap()).await;

        assert_eq!(names(&storage.get(&url("https://example.com/")).await), vec!["host", "sec"]);
        assert_eq!(names(&storage.get(&url("http://example.com/")).await), vec!["host"]);
        assert!(storage.get(&url("https://www.example.com/")).await.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_and_removal() {
        let storage = AcceptAllCookiesStorage::new();
        let origin = url("http://example.com/");
        storage.add_cookie(&origin, Cookie::parse("a=1").unwrap()).await;
        storage.add_cookie(&origin, Cookie::parse("a=2").unwrap()).await;

        let cookies = storage.get(&origin).await;
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value(), "2");

        storage.add_cookie(&origin, Cookie::parse("a=gone; Max-Age=0").unwrap()).await;
        assert!(storage.get(&origin).await.is_empty());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_expired_cookies_are_dropped() {
        let storage = AcceptAllCookiesStorage::new();
        let origin = url("http://example.com/");
        let now = SystemTime::now();
        storage.store(&origin, Cookie::parse("short=1; Max-Age=1").unwrap(), now);

        assert_eq!(storage.lookup(&origin, now).len(), 1);
        assert!(storage.lookup(&origin, now + Duration::from_secs(2)).is_empty());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_cookies_round_trip_through_client() {
        let engine = Arc::new(MockEngine::new(
            MockEngineConfig::new()
                .add_handler(|_| async {
                    Ok(respond(
                        StatusCode::OK,
                        headers_of(&[("set-cookie", "session=abc; Path=/"), ("set-cookie", "theme=dark")])?,
                        "first",
                    ))
                })
                .add_handler(|_| async { Ok(respond_ok("second")) }),
        ));
        let client = HttpClient::builder(engine.clone())
            .install::<HttpCookies, _>(|cfg| {
                cfg.default_cookie(url("http://localhost/"), Cookie::new("lang", "en"));
            })
            .build()
            .unwrap();

        client.get("http://localhost/login").send().await.unwrap();
        client
            .get("http://localhost/home")
            .header("Cookie", "explicit=1")
            .unwrap()
            .send()
            .await
            .unwrap();

        let requests = engine.requests();
        assert_eq!(requests[0].headers()["cookie"], "lang=en");
        let second = requests[1].headers()["cookie"].to_str().unwrap();
        assert!(second.starts_with("explicit=1; "));
        assert!(second.contains("session=abc"));
        assert!(second.contains("theme=dark"));

        let cookies = client.cookies(&url("http://localhost/")).await;
        assert_eq!(names(&cookies), vec!["lang", "session", "theme"]);
    }
}
