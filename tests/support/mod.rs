#![allow(dead_code)]

pub mod origin;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use http::{HeaderValue, Method};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use edgecache::cache::{CacheConfig, CacheRequest, ResponseCache, RouteRule, ServedResponse, gunzip};
use edgecache::gateway::{self, AppContext};
use edgecache::origin::OriginFetcher;

pub use origin::ScriptedOrigin;
pub use upstream::TestUpstream;

pub const HOST: &str = "api.example.com";

/// Cache settings used by the integration suites: everything under `/api/` is
/// force-gzipped for gzip clients, `/plain/` is not.
pub fn test_cache_config() -> CacheConfig {
    CacheConfig {
        default_ttl: StdDuration::from_secs(300),
        max_entries: 1024,
        total_capacity: 8 * 1024 * 1024,
        max_entry_size: 1024 * 1024,
        origin_timeout: StdDuration::from_secs(5),
        max_body_size: 4 * 1024 * 1024,
        sweeper_interval: StdDuration::from_secs(60),
        sweeper_batch_size: 100,
        routes: vec![
            RouteRule {
                path_prefix: "/api/".to_string(),
                force_gzip: true,
            },
            RouteRule {
                path_prefix: "/plain/".to_string(),
                force_gzip: false,
            },
        ],
    }
}

pub fn cache_with(origin: Arc<dyn OriginFetcher>, config: CacheConfig) -> ResponseCache {
    ResponseCache::new(config, origin).expect("build response cache")
}

pub fn gzip_request(path: &str) -> CacheRequest {
    CacheRequest::get(HOST, path).header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"))
}

pub fn plain_request(path: &str) -> CacheRequest {
    CacheRequest::get(HOST, path)
}

pub fn head_request(path: &str) -> CacheRequest {
    CacheRequest::new(Method::HEAD, "http", HOST, path)
}

pub fn content_encoding(response: &ServedResponse) -> Option<&str> {
    response
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
}

/// Decoded JSON body of a served response, gunzipping when it declares gzip.
pub fn decoded_json(response: &ServedResponse) -> serde_json::Value {
    let bytes = match content_encoding(response) {
        Some("gzip") => gunzip(&response.body, 16 * 1024 * 1024).expect("valid gzip body"),
        _ => response.body.to_vec(),
    };
    serde_json::from_slice(&bytes).expect("json body")
}

pub struct GatewayHarness {
    pub addr: SocketAddr,
    pub cache: ResponseCache,
    handle: JoinHandle<()>,
}

impl GatewayHarness {
    pub async fn spawn(cache: ResponseCache) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = AppContext::new(cache.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = gateway::serve(listener, app, std::future::pending()).await {
                tracing::error!(error = ?err, "gateway run failed");
            }
        });
        wait_for_listener(addr).await?;
        Ok(Self {
            addr,
            cache,
            handle,
        })
    }

    /// Sends one raw request with `Connection: close` and returns the full response text.
    pub async fn send(&self, path: &str, extra_headers: &str) -> Result<Vec<u8>> {
        self.send_method("GET", path, extra_headers).await
    }

    pub async fn send_method(
        &self,
        method: &str,
        path: &str,
        extra_headers: &str,
    ) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {HOST}\r\n{extra_headers}Connection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;
        let mut buf = Vec::new();
        timeout(StdDuration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .context("timed out reading gateway response")??;
        Ok(buf)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
        self.cache.shutdown();
    }
}

/// Splits a raw HTTP/1.1 response into its head and body.
pub fn split_response(raw: &[u8]) -> Result<(String, Vec<u8>)> {
    let pos = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = String::from_utf8(raw[..pos].to_vec()).context("invalid UTF-8 response head")?;
    Ok((head, raw[pos + 4..].to_vec()))
}

/// Case-insensitive header lookup in a raw response head.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

pub async fn wait_for_listener(addr: SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match timeout(StdDuration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => sleep(StdDuration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 request")
}
