// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `http://` / `https://` sources: progressive HTTP-FLV and HLS playlists.

use super::demux::{ByteStream, DemuxSource};
use super::hls::HlsSource;
use super::{MediaSource, OpenContext, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use mediacore_core::{MediaCoreError, Result, SourceUri};
use std::sync::OnceLock;
use std::time::Duration;

/// Transport for `http(s)://`. `.m3u8` URIs are treated as HLS playlists.
pub struct HttpTransport;

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, uri: &SourceUri, ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        if uri.extension().as_deref() == Some("m3u8") {
            return Ok(Box::new(HlsSource::open(uri.clone(), ctx).await?));
        }

        let (stream, content_type) = HttpByteStream::get(uri).await?;
        let container = uri
            .extension()
            .filter(|ext| ctx.demuxers.supports(ext))
            .or_else(|| content_type.as_deref().and_then(container_for_mime).map(str::to_string));
        let source = DemuxSource::open(Box::new(stream), &ctx.demuxers, container.as_deref()).await?;
        Ok(Box::new(source))
    }
}

pub(super) fn container_for_mime(mime: &str) -> Option<&'static str> {
    match mime.split(';').next().map(str::trim) {
        Some("video/x-flv" | "video/flv") => Some("flv"),
        Some("video/mp2t" | "video/MP2T") => Some("ts"),
        _ => None,
    }
}

pub(crate) fn shared_http_client() -> Result<&'static reqwest::Client> {
    static CLIENT: OnceLock<std::result::Result<reqwest::Client, reqwest::Error>> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .connect_timeout(Duration::from_secs(10))
                .build()
        })
        .as_ref()
        .map_err(|e| MediaCoreError::Runtime(format!("Failed to initialize HTTP client: {e}")))
}

fn network_error(context: &str, e: &reqwest::Error) -> MediaCoreError {
    MediaCoreError::Network(format!("{context}: {e}"))
}

async fn get_ok(uri: &SourceUri) -> Result<reqwest::Response> {
    let client = shared_http_client()?;
    let response = client
        .get(uri.as_url().clone())
        .send()
        .await
        .map_err(|e| network_error("HTTP request failed", &e))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() {
        Err(MediaCoreError::Network(format!("HTTP error {status} for {uri}")))
    } else {
        // 4xx will not fix itself on retry.
        Err(MediaCoreError::InvalidArgument(format!("HTTP error {status} for {uri}")))
    }
}

/// Fetches a small text document (playlist).
pub(crate) async fn fetch_text(uri: &SourceUri) -> Result<String> {
    get_ok(uri).await?.text().await.map_err(|e| network_error("reading body", &e))
}

/// Response body as a byte stream.
pub struct HttpByteStream {
    response: reqwest::Response,
}

impl HttpByteStream {
    /// Issues the GET and returns the body stream plus the response content type.
    ///
    /// # Errors
    ///
    /// `Network` for connection failures and 5xx, `InvalidArgument` for other non-2xx statuses.
    pub async fn get(uri: &SourceUri) -> Result<(Self, Option<String>)> {
        let response = get_ok(uri).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(len) = response.content_length() {
            tracing::debug!(content_length = len, "HTTP source opened");
        }
        Ok((Self { response }, content_type))
    }
}

#[async_trait]
impl ByteStream for HttpByteStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(|e| network_error("reading HTTP body", &e))
    }
}
