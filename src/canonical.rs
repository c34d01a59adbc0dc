//! Source URL canonicalisation and the `urlHash` derived from it.
//!
//! Two submissions denote the same document when their canonical forms are
//! equal. The canonical form keeps scheme, host, non-default port, path and
//! query, and drops everything else:
//!
//! - scheme, host, path and query are lower-cased
//! - a trailing `/` on the path is removed
//! - query pairs are sorted, empty pairs dropped
//! - fragment and userinfo are discarded
//!
//! `https://Gov.Example/Decree-12.pdf/?b=2&a=1#p3` and
//! `https://gov.example/decree-12.pdf?a=1&b=2` therefore share one hash.

use crate::error::IngestError;
use reqwest::Url;
use sha2::{Digest, Sha256};

/// A parsed source URL with its canonical form and hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    /// The URL as submitted (trimmed). Used for the actual download.
    pub source: String,
    pub canonical: String,
    /// Lower-case hex SHA-256 of `canonical`.
    pub hash: String,
}

impl CanonicalUrl {
    pub fn parse(input: &str) -> Result<Self, IngestError> {
        let source = input.trim().to_string();
        let canonical = canonicalize(&source)?;
        let hash = url_hash(&canonical);
        Ok(Self {
            source,
            canonical,
            hash,
        })
    }
}

/// Build the canonical form of an HTTP/HTTPS URL.
pub fn canonicalize(input: &str) -> Result<String, IngestError> {
    let invalid = |reason: &str| IngestError::InvalidUrl {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("only http and https URLs can be ingested"));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("URL has no host"))?;

    let mut out = format!("{}://{}", url.scheme(), host);
    // `Url::port` is None for the scheme's default port.
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path().trim_end_matches('/'));

    if let Some(query) = url.query() {
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        pairs.sort_unstable();
        if !pairs.is_empty() {
            out.push('?');
            out.push_str(&pairs.join("&"));
        }
    }

    Ok(out.to_lowercase())
}

/// Hex SHA-256 of a canonical URL.
pub fn url_hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
