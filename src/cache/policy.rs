use std::time::{Duration, SystemTime};

use http::header::{CACHE_CONTROL, EXPIRES, HeaderName, VARY};
use http::{HeaderMap, StatusCode};

use super::key::{MAX_VARY_HEADERS, VaryDirectives};

#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub must_revalidate: bool,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                let (name, arg) = match part.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (part, None),
                };
                if name.eq_ignore_ascii_case("public") {
                    cc.public = true;
                } else if name.eq_ignore_ascii_case("private") {
                    // `private="field"` still restricts the whole response for a shared cache.
                    cc.private = true;
                } else if name.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if name.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if name.eq_ignore_ascii_case("must-revalidate") {
                    cc.must_revalidate = true;
                } else if name.eq_ignore_ascii_case("max-age") {
                    if let Some(secs) = arg.and_then(|v| v.parse::<u64>().ok()) {
                        cc.max_age = Some(Duration::from_secs(secs));
                    }
                } else if name.eq_ignore_ascii_case("s-maxage")
                    && let Some(secs) = arg.and_then(|v| v.parse::<u64>().ok())
                {
                    cc.s_maxage = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

/// Parsed form of the response `Vary` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryHeader {
    Headers(VaryDirectives),
    Wildcard,
    TooWide,
}

pub fn parse_vary(headers: &HeaderMap) -> VaryHeader {
    let mut names = Vec::new();
    for value in headers.get_all(VARY) {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if name == "*" {
                return VaryHeader::Wildcard;
            }
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                names.push(name);
            }
        }
    }
    let directives = VaryDirectives::new(names);
    if directives.len() > MAX_VARY_HEADERS {
        return VaryHeader::TooWide;
    }
    VaryHeader::Headers(directives)
}

/// Lifetime from `s-maxage`, then `max-age`, then `Expires` relative to `now`.
///
/// An `Expires` date in the past, or one that does not parse, yields zero.
pub fn freshness_lifetime(
    cc: &CacheControl,
    headers: &HeaderMap,
    now: SystemTime,
) -> Option<Duration> {
    if let Some(s_maxage) = cc.s_maxage {
        return Some(s_maxage);
    }
    if let Some(max_age) = cc.max_age {
        return Some(max_age);
    }

    let expires = headers.get(EXPIRES)?;
    let lifetime = expires
        .to_str()
        .ok()
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .and_then(|expires_at| expires_at.duration_since(now).ok())
        .unwrap_or(Duration::ZERO);
    Some(lifetime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Status(StatusCode),
    NoStore,
    Private,
    NoCache,
    VaryWildcard,
    VaryTooWide,
    TooLarge,
    Expired,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Status(_) => "status",
            SkipReason::NoStore => "no-store",
            SkipReason::Private => "private",
            SkipReason::NoCache => "no-cache",
            SkipReason::VaryWildcard => "vary-wildcard",
            SkipReason::VaryTooWide => "vary-too-wide",
            SkipReason::TooLarge => "too-large",
            SkipReason::Expired => "expired",
        }
    }

    /// `Vary: *` means no stored representation of the key can be trusted.
    pub fn invalidates_key(&self) -> bool {
        matches!(self, SkipReason::VaryWildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Store { ttl: Duration, vary: VaryDirectives },
    Skip(SkipReason),
}

impl CacheDecision {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, CacheDecision::Store { .. })
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CacheDecision::Store { ttl, .. } => Some(*ttl),
            CacheDecision::Skip(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    default_ttl: Duration,
    max_entry_size: u64,
}

impl Classifier {
    pub fn new(default_ttl: Duration, max_entry_size: u64) -> Self {
        Self {
            default_ttl,
            max_entry_size,
        }
    }

    pub fn classify(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body_len: u64,
    ) -> CacheDecision {
        self.classify_at(status, headers, body_len, SystemTime::now())
    }

    pub fn classify_at(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body_len: u64,
        now: SystemTime,
    ) -> CacheDecision {
        if status != StatusCode::OK {
            return CacheDecision::Skip(SkipReason::Status(status));
        }

        let cc = parse_cache_control(headers);
        if cc.no_store {
            return CacheDecision::Skip(SkipReason::NoStore);
        }
        if cc.private {
            return CacheDecision::Skip(SkipReason::Private);
        }
        // Entries are never revalidated, so no-cache cannot be honoured by storing.
        if cc.no_cache {
            return CacheDecision::Skip(SkipReason::NoCache);
        }

        let vary = match parse_vary(headers) {
            VaryHeader::Headers(vary) => vary,
            VaryHeader::Wildcard => return CacheDecision::Skip(SkipReason::VaryWildcard),
            VaryHeader::TooWide => return CacheDecision::Skip(SkipReason::VaryTooWide),
        };

        if body_len > self.max_entry_size {
            return CacheDecision::Skip(SkipReason::TooLarge);
        }

        let ttl = freshness_lifetime(&cc, headers, now).unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return CacheDecision::Skip(SkipReason::Expired);
        }

        CacheDecision::Store { ttl, vary }
    }
}
