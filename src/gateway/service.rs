use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use tokio::time::Instant;
use tracing::warn;

use super::AppContext;
use crate::cache::{CacheError, CacheRequest, ServedResponse};
use crate::headers::{strip_hop_by_hop, upstream_request_headers};
use crate::logging::AccessLogBuilder;

const X_CACHE: &str = "x-cache";

/// Runs one inbound request through the response cache and renders the reply.
pub async fn handle_request<B>(
    app: &AppContext,
    peer: SocketAddr,
    request: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = parts
        .uri
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        });

    let log = AccessLogBuilder::new(peer)
        .method(parts.method.as_str())
        .path(path.clone());

    let Some(host) = host else {
        let response = error_response(StatusCode::BAD_REQUEST, "missing host\n");
        log.status(response.status())
            .error_reason("missing_host")
            .elapsed(started.elapsed())
            .log();
        return response;
    };
    let log = log.host(host.clone());

    let body = match Limited::new(body, app.max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let (status, reason) = if err.downcast_ref::<LengthLimitError>().is_some() {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_body_too_large")
            } else {
                (StatusCode::BAD_REQUEST, "request_body_error")
            };
            let response = error_response(status, "request body rejected\n");
            log.status(status)
                .error_reason(reason)
                .error_detail(err.to_string())
                .elapsed(started.elapsed())
                .log();
            return response;
        }
    };
    let bytes_in = body.len() as u64;
    let head = parts.method == Method::HEAD;

    let mut request = CacheRequest::new(parts.method, "http", host, &path).with_body(body);
    request.headers = upstream_request_headers(&parts.headers, peer.ip());

    match app.cache.handle(request).await {
        Ok(served) => {
            let mut log = log
                .status(served.status)
                .cache_status(served.cache_status.as_str())
                .stored(served.stored)
                .bytes(bytes_in, served.body.len() as u64);
            if let Some(bucket) = &served.bucket {
                log = log.variant(bucket.clone());
            }
            log.elapsed(started.elapsed()).log();
            render(served, head)
        }
        Err(err) => {
            let status = if err.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            warn!(peer = %peer, path = %path, error = %err, "request failed");
            log.status(status)
                .error_reason(err.kind())
                .error_detail(err.to_string())
                .bytes(bytes_in, 0)
                .elapsed(started.elapsed())
                .log();
            error_response(status, error_body(&err))
        }
    }
}

fn render(served: ServedResponse, head: bool) -> Response<Full<Bytes>> {
    let mut headers = served.headers;
    strip_hop_by_hop(&mut headers);
    headers.insert(HeaderName::from_static(X_CACHE), served.cache_status.header_value());
    // A bodiless reply keeps the length of the representation it describes.
    let keep_length = head || (served.body.is_empty() && headers.contains_key(CONTENT_LENGTH));
    if !keep_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(served.body.len()));
    }

    let mut response = Response::new(Full::new(served.body));
    *response.status_mut() = served.status;
    *response.headers_mut() = headers;
    response
}

fn error_body(err: &CacheError) -> &'static str {
    match err {
        CacheError::OriginTimeout(_) => "origin timed out\n",
        CacheError::OriginUnreachable(_) => "origin unreachable\n",
        CacheError::Decompression(_) => "origin sent an undecodable body\n",
        CacheError::OriginError(_) | CacheError::FetchAbandoned => "origin request failed\n",
    }
}

fn error_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}
