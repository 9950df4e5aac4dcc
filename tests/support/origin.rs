use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use edgecache::cache::gzip;
use edgecache::origin::{OriginError, OriginFetcher, OriginRequest, OriginResponse};
use http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, VARY,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use serde_json::json;

/// In-process origin serving the fixture endpoints the cache tests exercise.
///
/// Every JSON body echoes the request headers the origin saw and the fetch number,
/// so tests can tell which origin fetch produced a response.
pub struct ScriptedOrigin {
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    vary_star: AtomicBool,
    seen: Mutex<Vec<OriginRequest>>,
}

impl ScriptedOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            vary_star: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let origin = Self::new();
        origin.set_delay(delay);
        origin
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Makes `/api/vary-star/` answer with `Vary: *` from now on.
    pub fn set_vary_star(&self, enabled: bool) {
        self.vary_star.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.seen.lock().clone()
    }

    fn respond(
        &self,
        request: &OriginRequest,
        fetch: usize,
    ) -> Result<OriginResponse, OriginError> {
        let (path, query) = match request.path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (request.path_and_query.as_str(), ""),
        };
        let forced = query.split('&').any(|pair| pair == "force=true");
        let wants_gzip = request
            .headers
            .get(ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("gzip"));
        let body = echo_body(request, fetch);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        let response = match path {
            "/api/cacheable-compressible/" | "/plain/cacheable-compressible/" => {
                headers.insert(ETAG, HeaderValue::from_static("\"compressible\""));
                ok(headers, body)
            }
            "/api/cacheable-vary-accept-encoding/" => {
                headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
                ok(headers, body)
            }
            "/api/cacheable-vary-accept-encoding-multiple/" => {
                headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
                headers.append(VARY, HeaderValue::from_static("Accept"));
                ok(headers, body)
            }
            "/api/cacheable-pre-gzip/" => {
                headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
                maybe_gzip(headers, body, wants_gzip || forced)
            }
            "/api/cacheable-pre-gzip-multiple-vary/" => {
                headers.insert(VARY, HeaderValue::from_static("X-Foo, Accept-Encoding, Accept"));
                maybe_gzip(headers, body, true)
            }
            "/api/vary-language/" => {
                headers.insert(VARY, HeaderValue::from_static("Accept-Language"));
                ok(headers, body)
            }
            "/api/vary-star/" => {
                if self.vary_star.load(Ordering::SeqCst) {
                    headers.insert(VARY, HeaderValue::from_static("*"));
                }
                ok(headers, body)
            }
            "/api/short-ttl/" => {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=5"));
                ok(headers, body)
            }
            "/api/no-store/" => {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
                ok(headers, body)
            }
            "/api/malformed-gzip/" => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                ok(headers, Bytes::from_static(b"\x1f\x8b this is not gzip"))
            }
            "/api/multi-member-gzip/" => {
                let mut members = gzip(b"hello ").expect("gzip first member");
                members.extend(gzip(b"world").expect("gzip second member"));
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                ok(headers, Bytes::from(members))
            }
            "/api/brotli/" => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
                ok(headers, Bytes::from_static(b"opaque-brotli-bytes"))
            }
            "/api/unreachable/" => {
                return Err(OriginError::Unreachable("connection refused".to_string()));
            }
            _ => OriginResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"not found"),
            },
        };
        Ok(response)
    }
}

#[async_trait]
impl OriginFetcher for ScriptedOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let fetch = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().push(request.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut response = self.respond(&request, fetch)?;
        if request.method == Method::HEAD {
            response
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));
            response.body = Bytes::new();
        }
        Ok(response)
    }
}

fn echo_body(request: &OriginRequest, fetch: usize) -> Bytes {
    let headers: BTreeMap<String, String> = request
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = json!({
        "fetch": fetch,
        "path": request.path_and_query,
        "headers": headers,
        "padding": "x".repeat(1024),
    });
    Bytes::from(body.to_string())
}

fn ok(headers: HeaderMap, body: Bytes) -> OriginResponse {
    OriginResponse {
        status: StatusCode::OK,
        headers,
        body,
    }
}

fn maybe_gzip(mut headers: HeaderMap, body: Bytes, compress: bool) -> OriginResponse {
    if !compress {
        return ok(headers, body);
    }
    let compressed = gzip(&body).expect("gzip fixture body");
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    ok(headers, Bytes::from(compressed))
}
