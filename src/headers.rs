use std::collections::HashSet;
use std::net::IpAddr;

use http::header::{CONNECTION, HeaderName};
use http::{HeaderMap, HeaderValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    HopByHop,
    Forwarding,
    Forward,
}

/// Returns true when the header conveys forwarding metadata that should be stripped.
pub fn is_forwarding_header(name: &str) -> bool {
    if name.starts_with("x-forwarded-") {
        return true;
    }
    matches!(
        name,
        "forwarded"
            | "x-real-ip"
            | "x-client-ip"
            | "x-cluster-client-ip"
            | "true-client-ip"
            | "cf-connecting-ip"
            | "fastly-client-ip"
    ) || name.ends_with("-client-ip")
}

pub fn classify_header(name: &str) -> HeaderDisposition {
    if name == "connection" {
        HeaderDisposition::Connection
    } else if name == "host" {
        HeaderDisposition::Host
    } else if name.starts_with("proxy-")
        || matches!(
            name,
            "keep-alive" | "upgrade" | "te" | "trailer" | "transfer-encoding"
        )
    {
        HeaderDisposition::HopByHop
    } else if is_forwarding_header(name) {
        HeaderDisposition::Forwarding
    } else {
        HeaderDisposition::Forward
    }
}

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Removes hop-by-hop headers, including those nominated by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let tokens = connection_tokens(headers);
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            tokens.contains(name.as_str())
                || matches!(
                    classify_header(name.as_str()),
                    HeaderDisposition::Connection | HeaderDisposition::HopByHop
                )
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

/// Headers to send upstream for a client request: end-to-end headers only, with the
/// client's own forwarding claims replaced by the observed peer address.
pub fn upstream_request_headers(headers: &HeaderMap, peer: IpAddr) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        if tokens.contains(name.as_str()) {
            continue;
        }
        if classify_header(name.as_str()) == HeaderDisposition::Forward {
            out.append(name.clone(), value.clone());
        }
    }
    if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
        out.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    out
}
