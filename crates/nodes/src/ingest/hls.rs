// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HLS playlist source.
//!
//! The playlist is fetched while the session is connecting. Segments are fetched in order
//! and demuxed by whichever demuxer is registered for their container. Live playlists
//! (no `#EXT-X-ENDLIST`) are re-polled every target duration; VOD playlists are seekable.

use super::demux::DemuxSource;
use super::http::{container_for_mime, fetch_text, HttpByteStream};
use super::{DemuxerRegistry, MediaSource, OpenContext};
use async_trait::async_trait;
use mediacore_core::{EncodedPacket, MediaCoreError, Result, SourceUri, StreamInfo};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Segments kept from a live playlist when joining.
const LIVE_EDGE_SEGMENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: String,
    pub duration_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPlaylist {
    pub target_duration: Option<Duration>,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

fn attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    attrs.split(',').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

/// Parses an M3U8 document.
///
/// # Errors
///
/// `Unsupported` if the document does not start with `#EXTM3U`.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn parse_playlist(text: &str) -> Result<Playlist> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err(MediaCoreError::Unsupported("not an M3U8 playlist".to_string()));
    }

    let mut media = MediaPlaylist::default();
    let mut variants = Vec::new();
    let mut pending_duration: Option<u64> = None;
    let mut pending_variant: Option<Option<u64>> = None;

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            media.target_duration = value.parse::<u64>().ok().map(Duration::from_secs);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media.media_sequence = value.parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let secs = value.split(',').next().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            pending_duration = Some((secs.max(0.0) * 1_000_000.0) as u64);
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_variant = Some(attribute(attrs, "BANDWIDTH").and_then(|b| b.parse().ok()));
        } else if line == "#EXT-X-ENDLIST" {
            media.ended = true;
        } else if line.starts_with('#') {
            // Unhandled tag.
        } else if let Some(bandwidth) = pending_variant.take() {
            variants.push(Variant { uri: line.to_string(), bandwidth });
        } else {
            let sequence = media.media_sequence + media.segments.len() as u64;
            media.segments.push(Segment {
                sequence,
                uri: line.to_string(),
                duration_us: pending_duration.take().unwrap_or(0),
            });
        }
    }

    if variants.is_empty() {
        Ok(Playlist::Media(media))
    } else {
        Ok(Playlist::Master(variants))
    }
}

/// See the module docs.
pub struct HlsSource {
    playlist_uri: SourceUri,
    demuxers: Arc<DemuxerRegistry>,
    poll_fallback: Duration,
    /// Every segment of a VOD playlist (seek index); empty for live.
    all_segments: Vec<Segment>,
    queue: VecDeque<Segment>,
    last_sequence: Option<u64>,
    target_duration: Option<Duration>,
    ended: bool,
    current: Option<DemuxSource>,
    info: StreamInfo,
    skip_until_us: Option<u64>,
}

impl HlsSource {
    /// Fetches the playlist (following one master → media hop) and opens the first segment.
    ///
    /// # Errors
    ///
    /// Network/HTTP failures, malformed playlists, empty playlists, unsupported segment
    /// containers.
    pub async fn open(uri: SourceUri, ctx: &OpenContext) -> Result<Self> {
        let mut playlist_uri = uri;
        let mut playlist = parse_playlist(&fetch_text(&playlist_uri).await?)?;
        if let Playlist::Master(variants) = &playlist {
            let variant = variants
                .iter()
                .max_by_key(|v| v.bandwidth.unwrap_or(0))
                .ok_or_else(|| MediaCoreError::Unsupported("empty master playlist".to_string()))?;
            tracing::debug!(variant = %variant.uri, bandwidth = ?variant.bandwidth, "Selected HLS variant");
            playlist_uri = playlist_uri.join(&variant.uri)?;
            playlist = parse_playlist(&fetch_text(&playlist_uri).await?)?;
        }
        let Playlist::Media(media) = playlist else {
            return Err(MediaCoreError::Unsupported("nested master playlists".to_string()));
        };
        if media.segments.is_empty() {
            return Err(MediaCoreError::Network("playlist has no segments yet".to_string()));
        }

        let mut source = Self {
            playlist_uri,
            demuxers: ctx.demuxers.clone(),
            poll_fallback: Duration::from_millis(ctx.config.hls_poll_ms),
            all_segments: Vec::new(),
            queue: VecDeque::new(),
            last_sequence: None,
            target_duration: media.target_duration,
            ended: media.ended,
            current: None,
            info: StreamInfo::default(),
            skip_until_us: None,
        };
        source.enqueue(media);

        let first = source
            .queue
            .pop_front()
            .ok_or_else(|| MediaCoreError::Network("playlist has no segments".to_string()))?;
        let segment = source.open_segment(&first).await?;
        source.info = StreamInfo {
            streams: segment.stream_info().streams.clone(),
            seekable: source.ended,
            duration_us: source
                .ended
                .then(|| source.all_segments.iter().map(|s| s.duration_us).sum()),
        };
        source.current = Some(segment);
        Ok(source)
    }

    fn enqueue(&mut self, media: MediaPlaylist) {
        self.ended = media.ended;
        if media.target_duration.is_some() {
            self.target_duration = media.target_duration;
        }
        let fresh: Vec<Segment> = media
            .segments
            .into_iter()
            .filter(|s| self.last_sequence.is_none_or(|last| s.sequence > last))
            .collect();

        let skip = if self.last_sequence.is_none() && !self.ended {
            fresh.len().saturating_sub(LIVE_EDGE_SEGMENTS)
        } else {
            0
        };
        if let Some(last) = fresh.last() {
            self.last_sequence = Some(last.sequence);
        }
        if self.ended && self.all_segments.is_empty() {
            self.all_segments.clone_from(&fresh);
        }
        self.queue.extend(fresh.into_iter().skip(skip));
    }

    async fn open_segment(&self, segment: &Segment) -> Result<DemuxSource> {
        let uri = self.playlist_uri.join(&segment.uri)?;
        tracing::debug!(sequence = segment.sequence, uri = %uri, "Fetching HLS segment");
        let (stream, content_type) = HttpByteStream::get(&uri).await?;
        let container = uri
            .extension()
            .filter(|ext| self.demuxers.supports(ext))
            .or_else(|| content_type.as_deref().and_then(container_for_mime).map(str::to_string));
        DemuxSource::open(Box::new(stream), &self.demuxers, container.as_deref()).await
    }

    async fn refresh(&mut self) -> Result<()> {
        let wait = self.target_duration.unwrap_or(self.poll_fallback);
        tokio::time::sleep(wait).await;
        match parse_playlist(&fetch_text(&self.playlist_uri).await?)? {
            Playlist::Media(media) => {
                self.enqueue(media);
                Ok(())
            },
            Playlist::Master(_) => {
                Err(MediaCoreError::Unsupported("media playlist turned into a master".to_string()))
            },
        }
    }
}

#[async_trait]
impl MediaSource for HlsSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next_packet().await? {
                    Some(packet) => {
                        if self.skip_until_us.is_some_and(|pos| packet.timestamp_us < pos) {
                            continue;
                        }
                        self.skip_until_us = None;
                        return Ok(Some(packet));
                    },
                    None => self.current = None,
                }
            }

            if let Some(segment) = self.queue.pop_front() {
                self.current = Some(self.open_segment(&segment).await?);
                continue;
            }
            if self.ended {
                return Ok(None);
            }
            self.refresh().await?;
        }
    }

    async fn seek(&mut self, position_us: u64) -> Result<()> {
        if !self.ended {
            return Err(MediaCoreError::Unsupported("live HLS playlist".to_string()));
        }
        let mut start = 0u64;
        let mut index = self.all_segments.len().saturating_sub(1);
        for (i, segment) in self.all_segments.iter().enumerate() {
            if position_us < start + segment.duration_us {
                index = i;
                break;
            }
            start += segment.duration_us;
        }
        self.queue = self.all_segments.iter().skip(index).cloned().collect();
        self.current = None;
        self.skip_until_us = Some(position_us);
        Ok(())
    }
}
