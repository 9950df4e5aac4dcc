use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, ETAG, VARY};
use http::{HeaderMap, HeaderValue};
use thiserror::Error;

/// Encoding of the bytes held by a cache entry or requested by a client bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
        }
    }
}

/// What the origin actually sent, read from `Content-Encoding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginEncoding {
    Identity,
    Gzip,
    Other(String),
}

impl OriginEncoding {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut codings = Vec::new();
        for value in headers.get_all(CONTENT_ENCODING) {
            let Ok(value) = value.to_str() else {
                return OriginEncoding::Other("<binary>".to_string());
            };
            codings.extend(
                value
                    .split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty() && c != "identity"),
            );
        }
        match codings.as_slice() {
            [] => OriginEncoding::Identity,
            [single] if single == "gzip" || single == "x-gzip" => OriginEncoding::Gzip,
            _ => OriginEncoding::Other(codings.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodePlan {
    PassThrough,
    Decompress,
    Compress,
    /// Origin used an encoding the cache does not distinguish; serve it untouched, never store it.
    Unsupported,
}

impl TranscodePlan {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscodePlan::PassThrough => "passthrough",
            TranscodePlan::Decompress => "decompress",
            TranscodePlan::Compress => "compress",
            TranscodePlan::Unsupported => "unsupported",
        }
    }
}

pub fn negotiate(
    client: ContentEncoding,
    origin: &OriginEncoding,
    force_gzip: bool,
) -> TranscodePlan {
    match (client, origin) {
        (_, OriginEncoding::Other(_)) => TranscodePlan::Unsupported,
        (ContentEncoding::Gzip, OriginEncoding::Gzip) => TranscodePlan::PassThrough,
        (ContentEncoding::Identity, OriginEncoding::Gzip) => TranscodePlan::Decompress,
        (ContentEncoding::Gzip, OriginEncoding::Identity) if force_gzip => TranscodePlan::Compress,
        (_, OriginEncoding::Identity) => TranscodePlan::PassThrough,
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("malformed gzip body: {0}")]
    Malformed(#[source] std::io::Error),
    #[error("decoded body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("gzip encoding failed: {0}")]
    Encode(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Transcoded {
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Encoding of `body`; `None` when the origin used an encoding the cache does not handle.
    pub encoding: Option<ContentEncoding>,
    /// Set when a gzip body served untouched failed to decode; it is never stored.
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    max_decoded_size: usize,
}

impl Transcoder {
    pub fn new(max_decoded_size: usize) -> Self {
        Self { max_decoded_size }
    }

    pub fn apply(
        &self,
        plan: TranscodePlan,
        origin: &OriginEncoding,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Transcoded, TranscodeError> {
        let encoding = match (plan, origin) {
            (TranscodePlan::Unsupported, _) => None,
            (TranscodePlan::Decompress, _) => Some(ContentEncoding::Identity),
            (TranscodePlan::Compress, _) => Some(ContentEncoding::Gzip),
            (TranscodePlan::PassThrough, OriginEncoding::Gzip) => Some(ContentEncoding::Gzip),
            (TranscodePlan::PassThrough, _) => Some(ContentEncoding::Identity),
        };

        if matches!(plan, TranscodePlan::PassThrough | TranscodePlan::Unsupported) {
            let mut encoding = encoding;
            let mut rejected = None;
            if !body.is_empty() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                if encoding == Some(ContentEncoding::Gzip)
                    && let Err(err) = verify_gzip(&body, self.max_decoded_size)
                {
                    encoding = None;
                    rejected = Some(err.to_string());
                }
            }
            return Ok(Transcoded {
                headers,
                body,
                encoding,
                rejected,
            });
        }

        // HEAD and 204 carry no bytes to convert; the origin length would now be wrong.
        let body = if body.is_empty() {
            headers.remove(CONTENT_LENGTH);
            body
        } else {
            let converted = match plan {
                TranscodePlan::Decompress => gunzip(&body, self.max_decoded_size)?,
                _ => gzip(&body)?,
            };
            headers.insert(CONTENT_LENGTH, HeaderValue::from(converted.len()));
            Bytes::from(converted)
        };

        match plan {
            TranscodePlan::Decompress => {
                headers.remove(CONTENT_ENCODING);
            }
            _ => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
        }
        merge_vary_accept_encoding(&mut headers);
        weaken_etag(&mut headers);

        Ok(Transcoded {
            headers,
            body,
            encoding,
            rejected: None,
        })
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, TranscodeError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(TranscodeError::Encode)?;
    encoder.finish().map_err(TranscodeError::Encode)
}

/// Inflates every gzip member in `data`, refusing to produce more than `limit` bytes.
pub fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>, TranscodeError> {
    let decoder = MultiGzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(TranscodeError::Malformed)?;
    if out.len() > limit {
        return Err(TranscodeError::TooLarge { limit });
    }
    Ok(out)
}

/// Checks that `data` is a complete gzip stream without keeping the decoded bytes.
pub fn verify_gzip(data: &[u8], limit: usize) -> Result<(), TranscodeError> {
    let mut decoder = MultiGzDecoder::new(data).take(limit as u64 + 1);
    let decoded = io::copy(&mut decoder, &mut io::sink())
        .map_err(TranscodeError::Malformed)?;
    if decoded > limit as u64 {
        return Err(TranscodeError::TooLarge { limit });
    }
    Ok(())
}

fn merge_vary_accept_encoding(headers: &mut HeaderMap) {
    let mut tokens: Vec<String> = Vec::new();
    for value in headers.get_all(VARY) {
        if let Ok(value) = value.to_str() {
            tokens.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }
    if tokens
        .iter()
        .any(|t| t == "*" || t.eq_ignore_ascii_case("accept-encoding"))
    {
        return;
    }
    tokens.push("Accept-Encoding".to_string());
    if let Ok(value) = HeaderValue::from_str(&tokens.join(", ")) {
        headers.insert(VARY, value);
    }
}

fn weaken_etag(headers: &mut HeaderMap) {
    let Some(etag) = headers.get(ETAG) else {
        return;
    };
    if etag.as_bytes().starts_with(b"\"") {
        let mut weak = b"W/".to_vec();
        weak.extend_from_slice(etag.as_bytes());
        if let Ok(value) = HeaderValue::from_bytes(&weak) {
            headers.insert(ETAG, value);
        }
    }
}
