// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Source URI validation.
//!
//! `start` rejects malformed input synchronously, so parsing lives here rather than in the
//! ingest task.

use crate::error::MediaCoreError;
use std::str::FromStr;
use url::Url;

/// A parsed, validated source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUri {
    url: Url,
}

impl SourceUri {
    /// Parses and validates a source URI.
    ///
    /// # Errors
    ///
    /// Returns `MediaCoreError::InvalidArgument` if the string is empty, does not parse as an
    /// absolute URI, or a network scheme lacks a host.
    pub fn parse(input: &str) -> Result<Self, MediaCoreError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MediaCoreError::InvalidArgument("source uri is empty".to_string()));
        }

        let url = Url::parse(trimmed).map_err(|e| {
            MediaCoreError::InvalidArgument(format!("malformed source uri '{trimmed}': {e}"))
        })?;

        if Self::is_network_scheme(url.scheme()) && url.host_str().is_none_or(str::is_empty) {
            return Err(MediaCoreError::InvalidArgument(format!(
                "source uri '{trimmed}' has no host"
            )));
        }

        Ok(Self { url })
    }

    fn is_network_scheme(scheme: &str) -> bool {
        matches!(scheme, "rtmp" | "rtmps" | "http" | "https")
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port_or_default(&self) -> Option<u16> {
        self.url.port_or_known_default().or(match self.url.scheme() {
            "rtmp" => Some(1935),
            "rtmps" => Some(443),
            _ => None,
        })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Lower-cased extension of the last path segment, if any.
    pub fn extension(&self) -> Option<String> {
        let last = self.url.path_segments()?.next_back()?;
        let (_, ext) = last.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }

    /// Value of a query parameter.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
    }

    pub const fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Resolves a reference (e.g. an HLS segment) against this URI.
    ///
    /// # Errors
    ///
    /// Returns `MediaCoreError::InvalidArgument` if the reference cannot be joined.
    pub fn join(&self, reference: &str) -> Result<Self, MediaCoreError> {
        let url = self.url.join(reference).map_err(|e| {
            MediaCoreError::InvalidArgument(format!("bad reference '{reference}': {e}"))
        })?;
        Ok(Self { url })
    }
}

impl FromStr for SourceUri {
    type Err = MediaCoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for SourceUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_rtmp_with_default_port() {
        let uri = SourceUri::parse("rtmp://host/live/demo").unwrap();
        assert_eq!(uri.scheme(), "rtmp");
        assert_eq!(uri.host(), Some("host"));
        assert_eq!(uri.port_or_default(), Some(1935));
        assert_eq!(uri.path(), "/live/demo");
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(matches!(SourceUri::parse(""), Err(MediaCoreError::InvalidArgument(_))));
        assert!(matches!(SourceUri::parse("   "), Err(MediaCoreError::InvalidArgument(_))));
        assert!(matches!(SourceUri::parse("not a uri"), Err(MediaCoreError::InvalidArgument(_))));
        assert!(matches!(SourceUri::parse("rtmp:///live"), Err(MediaCoreError::InvalidArgument(_))));
    }

    #[test]
    fn extension_and_join() {
        let uri = SourceUri::parse("https://cdn.example/path/index.M3U8?token=1").unwrap();
        assert_eq!(uri.extension().as_deref(), Some("m3u8"));
        assert_eq!(uri.query_param("token").as_deref(), Some("1"));

        let seg = uri.join("seg-001.flv").unwrap();
        assert_eq!(seg.as_str(), "https://cdn.example/path/seg-001.flv");
    }

    #[test]
    fn synthetic_scheme_without_host_is_fine() {
        let uri = SourceUri::parse("synthetic://test?duration_ms=500").unwrap();
        assert_eq!(uri.query_param("duration_ms").as_deref(), Some("500"));
    }
}
