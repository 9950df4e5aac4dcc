use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use bytes::Bytes;
use http::uri::{PathAndQuery, Uri};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::trace;

use crate::headers::{HeaderDisposition, classify_header, strip_hop_by_hop};

#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to connect to origin: {0}")]
    Unreachable(String),
    #[error("origin request failed: {0}")]
    Request(String),
    #[error("origin response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// The fetch the cache performs on a miss.
#[async_trait]
pub trait OriginFetcher: Send + Sync + 'static {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError>;
}

/// HTTP/1.1 origin reached through a pooled hyper client.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    base: Uri,
    client: Client<HttpConnector, Full<Bytes>>,
    max_body_size: usize,
}

impl HttpOrigin {
    pub fn new(base: &str, max_body_size: usize) -> Result<Self> {
        let base: Uri = base
            .parse()
            .with_context(|| format!("invalid origin url '{base}'"))?;
        ensure!(
            base.scheme_str() == Some("http"),
            "origin url must use the http scheme (got '{base}')"
        );
        ensure!(base.authority().is_some(), "origin url must include a host (got '{base}')");

        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            base,
            client,
            max_body_size,
        })
    }

    fn target_uri(&self, path_and_query: &str) -> Result<Uri, OriginError> {
        let prefix = self.base.path().trim_end_matches('/');
        let joined = format!("{prefix}{path_and_query}");
        let path_and_query = PathAndQuery::try_from(joined.as_str())
            .map_err(|err| OriginError::Request(format!("invalid request target: {err}")))?;
        let mut parts = self.base.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(|err| OriginError::Request(err.to_string()))
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let uri = self.target_uri(&request.path_and_query)?;
        trace!(method = %request.method, uri = %uri, "fetching from origin");

        let mut builder = Request::builder().method(request.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &request.headers {
                // The client derives Host from the origin url.
                if classify_header(name.as_str()) != HeaderDisposition::Host {
                    headers.append(name.clone(), value.clone());
                }
            }
            strip_hop_by_hop(headers);
        }
        let outbound = builder
            .body(Full::new(request.body))
            .map_err(|err| OriginError::Request(err.to_string()))?;

        let response = self.client.request(outbound).await.map_err(|err| {
            if err.is_connect() {
                OriginError::Unreachable(err.to_string())
            } else {
                OriginError::Request(err.to_string())
            }
        })?;

        let (mut parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    OriginError::BodyTooLarge {
                        limit: self.max_body_size,
                    }
                } else {
                    OriginError::Request(err.to_string())
                }
            })?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);

        Ok(OriginResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}
