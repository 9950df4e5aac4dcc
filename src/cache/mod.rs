use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, AGE, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

mod coalesce;
mod entry;
mod error;
mod index;
mod key;
mod maintenance;
mod policy;
mod store;
mod transcode;

use coalesce::{Coalescer, FetchOwner, Joined};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use key::{CacheKey, VariantBucket, VaryDirectives, accepts_gzip, is_cacheable_method};
use maintenance::spawn_cache_sweeper;
pub use policy::{
    CacheControl, CacheDecision, Classifier, SkipReason, VaryHeader, freshness_lifetime,
    parse_cache_control, parse_vary,
};
pub use store::{SweepStats, VariantStore};
pub use transcode::{
    ContentEncoding, OriginEncoding, TranscodeError, TranscodePlan, Transcoded, Transcoder, gunzip,
    gzip, negotiate, verify_gzip,
};

use crate::origin::{OriginFetcher, OriginRequest, OriginResponse};

/// Path prefix that forces gzip for clients that accept it, even when the origin sends identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,
    #[serde(default)]
    pub force_gzip: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub total_capacity: u64,
    pub max_entry_size: u64,
    pub origin_timeout: Duration,
    pub max_body_size: usize,
    pub sweeper_interval: Duration,
    pub sweeper_batch_size: usize,
    pub routes: Vec<RouteRule>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 10_000,
            total_capacity: 256 * 1024 * 1024,
            max_entry_size: 10 * 1024 * 1024,
            origin_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024 * 1024,
            sweeper_interval: Duration::from_secs(60),
            sweeper_batch_size: 1000,
            routes: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Longest matching prefix decides.
    pub fn force_gzip(&self, path: &str) -> bool {
        self.routes
            .iter()
            .filter(|route| path.starts_with(&route.path_prefix))
            .max_by_key(|route| route.path_prefix.len())
            .is_some_and(|route| route.force_gzip)
    }
}

/// Inbound request as seen by the cache.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CacheRequest {
    pub fn new(
        method: Method,
        scheme: impl Into<String>,
        host: impl Into<String>,
        path_and_query: &str,
    ) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            method,
            scheme: scheme.into(),
            host: host.into(),
            path: path.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(host: impl Into<String>, path_and_query: &str) -> Self {
        Self::new(Method::GET, "http", host, path_and_query)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Coalesced,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Coalesced => "coalesced",
            CacheStatus::Bypass => "bypass",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        match self {
            CacheStatus::Hit => HeaderValue::from_static("HIT"),
            CacheStatus::Miss => HeaderValue::from_static("MISS"),
            CacheStatus::Coalesced => HeaderValue::from_static("COALESCED"),
            CacheStatus::Bypass => HeaderValue::from_static("BYPASS"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_status: CacheStatus,
    /// Variant label, absent for bypassed requests.
    pub bucket: Option<String>,
    pub stored: bool,
}

/// Outcome of one origin fetch, shared by its owner and every waiter.
#[derive(Debug)]
struct FetchedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    bucket: VariantBucket,
    vary: VaryDirectives,
    stored: bool,
}

impl FetchedResponse {
    fn from_entry(entry: &CacheEntry, vary: VaryDirectives) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            bucket: entry.bucket.clone(),
            vary,
            stored: true,
        }
    }

    fn serve(&self, cache_status: CacheStatus) -> ServedResponse {
        ServedResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            cache_status,
            bucket: Some(self.bucket.to_string()),
            stored: self.stored,
        }
    }
}

/// The gateway's response cache. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct ResponseCache {
    state: Arc<CacheState>,
}

struct CacheState {
    store: Arc<VariantStore>,
    coalescer: Arc<Coalescer<FetchedResponse>>,
    classifier: Classifier,
    transcoder: Transcoder,
    origin: Arc<dyn OriginFetcher>,
    config: CacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    draining: AtomicBool,
}

impl ResponseCache {
    /// Must be called within a tokio runtime; starts the expiry sweeper.
    pub fn new(config: CacheConfig, origin: Arc<dyn OriginFetcher>) -> Result<Self> {
        let store = Arc::new(VariantStore::new(
            config.max_entries,
            config.total_capacity,
            config.max_entry_size,
        )?);
        let sweeper = spawn_cache_sweeper(
            Arc::downgrade(&store),
            config.sweeper_interval,
            config.sweeper_batch_size,
        );
        let state = Arc::new(CacheState {
            store,
            coalescer: Arc::new(Coalescer::default()),
            classifier: Classifier::new(config.default_ttl, config.max_entry_size),
            transcoder: Transcoder::new(config.max_body_size),
            origin,
            config,
            sweeper: Mutex::new(sweeper),
            draining: AtomicBool::new(false),
        });
        Ok(Self { state })
    }

    pub fn store(&self) -> &VariantStore {
        &self.state.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.state.config
    }

    /// Number of origin fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state.coalescer.in_flight()
    }

    /// Serves `request` from the store, or from a single shared origin fetch on a miss.
    pub async fn handle(&self, request: CacheRequest) -> Result<ServedResponse, CacheError> {
        let Some(key) = CacheKey::for_request(&request) else {
            return self.bypass(request).await;
        };
        let force_gzip = self.state.config.force_gzip(&request.path);
        let mut reresolved = false;

        loop {
            let directives = self.state.store.directives(&key);
            let bucket = VariantBucket::for_request(&request.headers, &directives);

            if let Some(served) = self.serve_hit(&key, &bucket) {
                return Ok(served);
            }

            let (subscription, owner) = match self.state.coalescer.join((key, bucket.clone())) {
                Joined::Owner(owner, subscription) => {
                    // A fetch may have completed between the lookup and the join.
                    if let Some(entry) = self.state.store.lookup(&key, &bucket) {
                        let fetched = Arc::new(FetchedResponse::from_entry(&entry, directives));
                        owner.publish(Ok(fetched));
                        return Ok(self.finish(self.entry_response(&entry), &key));
                    }
                    trace!(key = %key, bucket = %bucket, "cache miss; fetching from origin");
                    self.spawn_fetch(
                        owner,
                        key,
                        bucket.clone(),
                        directives.clone(),
                        &request,
                        force_gzip,
                    );
                    (subscription, true)
                }
                Joined::Waiter(subscription) => {
                    debug!(key = %key, bucket = %bucket, "joining in-flight origin fetch");
                    crate::metrics::record_coalesced_waiter();
                    (subscription, false)
                }
            };

            let fetched = subscription.wait().await?;

            if !owner && !reresolved && fetched.vary != directives {
                let own = VariantBucket::for_request(&request.headers, &fetched.vary);
                if own != fetched.bucket {
                    debug!(
                        key = %key,
                        bucket = %own,
                        "learned vary differs for waiter; resolving again"
                    );
                    reresolved = true;
                    continue;
                }
            }

            let status = if owner {
                CacheStatus::Miss
            } else {
                CacheStatus::Coalesced
            };
            return Ok(self.finish(fetched.serve(status), &key));
        }
    }

    /// Store-only lookup; never contacts the origin.
    pub fn lookup(&self, request: &CacheRequest) -> Option<ServedResponse> {
        let key = CacheKey::for_request(request)?;
        let directives = self.state.store.directives(&key);
        let bucket = VariantBucket::for_request(&request.headers, &directives);
        self.serve_hit(&key, &bucket)
    }

    pub fn invalidate(&self, request: &CacheRequest) -> usize {
        CacheKey::for_request(request)
            .map(|key| self.state.store.invalidate(&key))
            .unwrap_or(0)
    }

    /// Stops the sweeper and drains the store. Fetches still in flight are served but not stored.
    pub fn shutdown(&self) -> usize {
        self.state.draining.store(true, Ordering::SeqCst);
        if let Some(handle) = self.state.sweeper.lock().take() {
            handle.abort();
        }
        let drained = self.state.store.clear();
        debug!(drained, in_flight = self.in_flight(), "response cache drained");
        drained
    }

    fn serve_hit(&self, key: &CacheKey, bucket: &VariantBucket) -> Option<ServedResponse> {
        let entry = self.state.store.lookup(key, bucket)?;
        trace!(key = %key, bucket = %bucket, "cache hit");
        Some(self.finish(self.entry_response(&entry), key))
    }

    fn entry_response(&self, entry: &CacheEntry) -> ServedResponse {
        let mut headers = entry.headers.clone();
        headers.insert(AGE, HeaderValue::from(entry.age(Instant::now()).as_secs()));
        ServedResponse {
            status: entry.status,
            headers,
            body: entry.body.clone(),
            cache_status: CacheStatus::Hit,
            bucket: Some(entry.bucket.to_string()),
            stored: true,
        }
    }

    fn finish(&self, served: ServedResponse, key: &CacheKey) -> ServedResponse {
        trace!(key = %key, status = served.cache_status.as_str(), "cache lookup finished");
        crate::metrics::record_cache_lookup(served.cache_status.as_str());
        crate::metrics::record_bytes_served(served.body.len() as u64);
        served
    }

    fn spawn_fetch(
        &self,
        owner: FetchOwner<FetchedResponse>,
        key: CacheKey,
        bucket: VariantBucket,
        directives: VaryDirectives,
        request: &CacheRequest,
        force_gzip: bool,
    ) {
        let state = self.state.clone();
        let origin_request = origin_request_for(request, bucket.encoding());
        let request_headers = request.headers.clone();
        tokio::spawn(async move {
            let result = state
                .fetch_and_store(
                    key,
                    bucket,
                    directives,
                    origin_request,
                    &request_headers,
                    force_gzip,
                )
                .await;
            owner.publish(result.map(Arc::new));
        });
    }

    async fn bypass(&self, request: CacheRequest) -> Result<ServedResponse, CacheError> {
        trace!(method = %request.method, path = %request.path, "method bypasses cache");
        let origin_request = OriginRequest {
            method: request.method.clone(),
            path_and_query: request.path_and_query(),
            headers: request.headers,
            body: request.body,
        };
        let response = self.state.fetch_origin(origin_request).await?;
        crate::metrics::record_cache_lookup(CacheStatus::Bypass.as_str());
        crate::metrics::record_bytes_served(response.body.len() as u64);
        Ok(ServedResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            cache_status: CacheStatus::Bypass,
            bucket: None,
            stored: false,
        })
    }
}

impl CacheState {
    async fn fetch_origin(&self, request: OriginRequest) -> Result<OriginResponse, CacheError> {
        let timeout = self.config.origin_timeout;
        match tokio::time::timeout(timeout, self.origin.fetch(request)).await {
            Ok(Ok(response)) => {
                crate::metrics::record_origin_fetch("ok");
                Ok(response)
            }
            Ok(Err(err)) => {
                let err = CacheError::from(err);
                crate::metrics::record_origin_fetch(err.kind());
                Err(err)
            }
            Err(_) => {
                crate::metrics::record_origin_fetch("timeout");
                Err(CacheError::OriginTimeout(timeout))
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: CacheKey,
        bucket: VariantBucket,
        directives: VaryDirectives,
        request: OriginRequest,
        request_headers: &HeaderMap,
        force_gzip: bool,
    ) -> Result<FetchedResponse, CacheError> {
        let response = self.fetch_origin(request).await.inspect_err(|err| {
            warn!(key = %key, bucket = %bucket, error = %err, "origin fetch failed");
        })?;

        let decision = self
            .classifier
            .classify(response.status, &response.headers, response.body.len() as u64);
        if let CacheDecision::Skip(reason) = &decision {
            trace!(
                key = %key,
                bucket = %bucket,
                reason = reason.as_str(),
                "response not cacheable"
            );
            if reason.invalidates_key() {
                let removed = self.store.invalidate(&key);
                debug!(key = %key, removed, "vary wildcard invalidated cached variants");
            }
        }

        let origin_encoding = OriginEncoding::from_headers(&response.headers);
        let plan = negotiate(bucket.encoding(), &origin_encoding, force_gzip);
        crate::metrics::record_transcode(plan.as_str());
        let transcoded = self
            .transcoder
            .apply(plan, &origin_encoding, response.headers, response.body)
            .map_err(|err| {
                warn!(
                    key = %key,
                    bucket = %bucket,
                    plan = plan.as_str(),
                    error = %err,
                    "failed to transcode origin response"
                );
                crate::metrics::record_transcode("failed");
                CacheError::Decompression(err.to_string())
            })?;
        if let Some(reason) = &transcoded.rejected {
            warn!(
                key = %key,
                bucket = %bucket,
                error = %reason,
                "origin gzip body failed to decode; serving without storing"
            );
            crate::metrics::record_transcode("failed");
        }

        let (stored_bucket, vary) = match &decision {
            CacheDecision::Store { vary, .. } => {
                let learned = VariantBucket::for_request(request_headers, vary)
                    .with_encoding(bucket.encoding());
                (learned, vary.clone())
            }
            CacheDecision::Skip(_) => (bucket, directives),
        };

        let mut stored = false;
        if let (CacheDecision::Store { ttl, .. }, Some(encoding)) = (&decision, transcoded.encoding)
            && !self.draining.load(Ordering::SeqCst)
        {
            let entry = CacheEntry::new(
                key,
                stored_bucket.clone(),
                response.status,
                transcoded.headers.clone(),
                transcoded.body.clone(),
                encoding,
                *ttl,
                Instant::now(),
            );
            stored = self.store.insert(entry, vary.clone()).is_some();
            trace!(key = %key, bucket = %stored_bucket, stored, "origin response processed");
        }

        Ok(FetchedResponse {
            status: response.status,
            headers: transcoded.headers,
            body: transcoded.body,
            bucket: stored_bucket,
            vary,
            stored,
        })
    }
}

fn origin_request_for(request: &CacheRequest, encoding: ContentEncoding) -> OriginRequest {
    let mut headers = request.headers.clone();
    headers.remove(ACCEPT_ENCODING);
    if encoding == ContentEncoding::Gzip {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    OriginRequest {
        method: request.method.clone(),
        path_and_query: request.path_and_query(),
        headers,
        body: request.body.clone(),
    }
}
