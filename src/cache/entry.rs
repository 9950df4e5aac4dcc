use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::time::Instant;

use super::key::{CacheKey, VariantBucket};
use super::transcode::ContentEncoding;

/// Immutable stored representation. Shared as `Arc<CacheEntry>` and replaced, never mutated.
#[derive(Debug)]
pub struct CacheEntry {
    pub(super) id: u64,
    pub(super) key: CacheKey,
    pub(super) bucket: VariantBucket,
    pub(super) status: StatusCode,
    pub(super) headers: HeaderMap,
    pub(super) body: Bytes,
    pub(super) stored_encoding: ContentEncoding,
    pub(super) created_at: Instant,
    pub(super) expires_at: Instant,
    pub(super) size_bytes: u64,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        key: CacheKey,
        bucket: VariantBucket,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        stored_encoding: ContentEncoding,
        ttl: Duration,
        now: Instant,
    ) -> Self {
        let size_bytes = body.len() as u64 + header_bytes(&headers);
        Self {
            id: 0,
            key,
            bucket,
            status,
            headers,
            body,
            stored_encoding,
            created_at: now,
            expires_at: now + ttl,
            size_bytes,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn bucket(&self) -> &VariantBucket {
        &self.bucket
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn stored_encoding(&self) -> ContentEncoding {
        self.stored_encoding
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

fn header_bytes(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.len()) as u64)
        .sum()
}
