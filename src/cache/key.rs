use std::fmt;

use http::header::{ACCEPT_ENCODING, HeaderName};
use http::{HeaderMap, HeaderValue, Method};

use super::CacheRequest;
use super::transcode::ContentEncoding;

pub(crate) const MAX_VARY_HEADERS: usize = 8;

/// Identity of a cacheable resource, independent of its representation.
///
/// Hashes the canonical form of method, scheme, host, path and query so two
/// requests that differ only in query parameter order or host case share a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Returns `None` for methods that never touch the cache.
    pub fn for_request(request: &CacheRequest) -> Option<Self> {
        Self::from_parts(
            &request.method,
            &request.scheme,
            &request.host,
            &request.path,
            request.query.as_deref(),
        )
    }

    pub fn from_parts(
        method: &Method,
        scheme: &str,
        host: &str,
        path: &str,
        query: Option<&str>,
    ) -> Option<Self> {
        if !is_cacheable_method(method) {
            return None;
        }
        let canonical = canonical_form(method, scheme, host, path, query);
        Some(Self(*blake3::hash(canonical.as_bytes()).as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

pub fn is_cacheable_method(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn canonical_form(
    method: &Method,
    scheme: &str,
    host: &str,
    path: &str,
    query: Option<&str>,
) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let query = query.map(sorted_query).unwrap_or_default();
    format!(
        "{method}\n{}\n{}\n{path}\n{query}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase()
    )
}

// Stable sort keeps repeated parameters (`a=1&a=2`) in their original order.
fn sorted_query(query: &str) -> String {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_by(|a, b| param_name(a).cmp(param_name(b)));
    params.join("&")
}

fn param_name(param: &str) -> &str {
    param.split_once('=').map(|(name, _)| name).unwrap_or(param)
}

/// Request header names an origin declared through `Vary`, learned per key.
///
/// `Accept-Encoding` never appears here; the encoding dimension is always part
/// of the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaryDirectives {
    headers: Vec<HeaderName>,
}

impl VaryDirectives {
    pub fn new(names: impl IntoIterator<Item = HeaderName>) -> Self {
        let mut headers: Vec<HeaderName> = names
            .into_iter()
            .filter(|name| name != ACCEPT_ENCODING)
            .collect();
        headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        headers.dedup();
        Self { headers }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderName> {
        self.headers.iter()
    }
}

/// Which representation of a key a request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantBucket {
    encoding: ContentEncoding,
    vary: Vec<(HeaderName, Option<HeaderValue>)>,
}

impl VariantBucket {
    pub fn for_request(headers: &HeaderMap, directives: &VaryDirectives) -> Self {
        let encoding = if accepts_gzip(headers) {
            ContentEncoding::Gzip
        } else {
            ContentEncoding::Identity
        };
        let vary = directives
            .iter()
            .map(|name| (name.clone(), combined_value(headers, name)))
            .collect();
        Self { encoding, vary }
    }

    pub fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

impl fmt::Display for VariantBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding.as_str())?;
        for (name, value) in &self.vary {
            match value.as_ref().and_then(|v| v.to_str().ok()) {
                Some(value) => write!(f, "|{name}={value}")?,
                None if value.is_some() => write!(f, "|{name}=<binary>")?,
                None => write!(f, "|{name}=-")?,
            }
        }
        Ok(())
    }
}

/// True when `Accept-Encoding` lists `gzip` with a non-zero q-value.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or_default().trim();
            coding.eq_ignore_ascii_case("gzip") && !params.any(is_zero_qvalue)
        })
}

fn is_zero_qvalue(param: &str) -> bool {
    let Some((name, value)) = param.split_once('=') else {
        return false;
    };
    name.trim().eq_ignore_ascii_case("q")
        && value
            .trim()
            .parse::<f32>()
            .map(|q| q <= 0.0)
            .unwrap_or(false)
}

// Repeated header lines are folded the way a single comma-separated line would read.
fn combined_value(headers: &HeaderMap, name: &HeaderName) -> Option<HeaderValue> {
    let mut values = headers.get_all(name).iter();
    let first = values.next()?;
    let mut combined = first.as_bytes().to_vec();
    for value in values {
        combined.extend_from_slice(b", ");
        combined.extend_from_slice(value.as_bytes());
    }
    HeaderValue::from_bytes(&combined).ok()
}
