// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `rtmp://` sources.
//!
//! Plays `rtmp://host[:port]/app/stream` as an RTMP client: handshake, `connect`,
//! `createStream` and `play`, then rewraps the audio, video and data messages as FLV
//! tags so the FLV demuxer does the codec work.

pub mod amf0;
pub mod chunk;
pub mod handshake;
pub mod session;

use self::amf0::Amf0Value;
use self::chunk::{message_type, RtmpMessage};
use self::session::{RtmpSession, RtmpUrl};
use super::demux::{ByteStream, DemuxSource};
use super::{MediaSource, OpenContext, Transport};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use mediacore_core::{MediaCoreError, Result, SourceUri};
use std::time::Instant;
use tokio::net::TcpStream;

/// Messages held back while the stream layout is unknown.
const LAYOUT_MAX_MESSAGES: usize = 64;
const FLV_TAG_HEADER_LEN: usize = 11;

pub struct RtmpTransport;

#[async_trait]
impl Transport for RtmpTransport {
    async fn open(&self, uri: &SourceUri, ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        let url = RtmpUrl::parse(uri)?;
        let timeout = ctx.config.connect_timeout();
        let started = Instant::now();
        let setup = async {
            let socket = TcpStream::connect((url.host.as_str(), url.port)).await.map_err(|e| {
                MediaCoreError::Network(format!("connecting to {}:{}: {e}", url.host, url.port))
            })?;
            socket.set_nodelay(true)?;
            RtmpSession::play(socket, &url, ctx.config.read_chunk_size).await
        };
        let session = tokio::time::timeout(timeout, setup).await.map_err(|_| {
            MediaCoreError::Timeout(format!("RTMP session setup for {uri} exceeded {timeout:?}"))
        })??;
        let setup_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(%uri, setup_ms, "RTMP session connected");

        let stream = RtmpByteStream { session, setup_ms, header_sent: false };
        let source = DemuxSource::open(Box::new(stream), &ctx.demuxers, Some("flv")).await?;
        Ok(Box::new(source))
    }
}

/// FLV byte stream fed by an RTMP play session.
pub struct RtmpByteStream {
    session: RtmpSession<TcpStream>,
    setup_ms: u64,
    header_sent: bool,
}

impl RtmpByteStream {
    /// FLV header plus the messages read while working out which kinds are present.
    async fn preamble(&mut self) -> Result<Bytes> {
        let mut held = Vec::new();
        let mut seen = (false, false);
        let mut declared = None;
        while held.len() < LAYOUT_MAX_MESSAGES {
            let Some(message) = self.session.next_media().await? else { break };
            match message.type_id {
                message_type::AUDIO => seen.0 = true,
                message_type::VIDEO => seen.1 = true,
                message_type::DATA_AMF0 => declared = declared.or_else(|| metadata_layout(&message.payload)),
                message_type::AGGREGATE => {
                    let (audio, video) = aggregate_kinds(&message.payload);
                    seen = (seen.0 || audio, seen.1 || video);
                },
                _ => {},
            }
            held.push(message);
            if declared.is_some() || (seen.0 && seen.1) {
                break;
            }
        }
        let (has_audio, has_video) = declared.unwrap_or(seen);
        tracing::debug!(has_audio, has_video, held = held.len(), "RTMP stream layout");

        let mut out = BytesMut::with_capacity(256);
        out.put_slice(b"FLV");
        out.put_u8(1);
        out.put_u8((u8::from(has_audio) << 2) | u8::from(has_video));
        out.put_u32(9);
        out.put_u32(0);
        for message in &held {
            append_tags(message, &mut out);
        }
        Ok(out.freeze())
    }
}

#[async_trait]
impl ByteStream for RtmpByteStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.header_sent {
            self.header_sent = true;
            return self.preamble().await.map(Some);
        }
        let Some(message) = self.session.next_media().await? else { return Ok(None) };
        let mut out = BytesMut::with_capacity(message.payload.len() + FLV_TAG_HEADER_LEN + 4);
        append_tags(&message, &mut out);
        Ok(Some(out.freeze()))
    }

    /// Connect, handshake and play setup time.
    fn rtt_ms(&self) -> Option<u64> {
        Some(self.setup_ms)
    }
}

/// `(has_audio, has_video)` from an `onMetaData` message, when it says.
fn metadata_layout(payload: &[u8]) -> Option<(bool, bool)> {
    let values = amf0::decode_all(payload).ok()?;
    let mut values = values.iter().skip_while(|v| v.as_str().is_some());
    let meta = values.next()?;
    let flag = |has: &str, codec: &str| match meta.get(has) {
        Some(Amf0Value::Boolean(b)) => Some(*b),
        _ => meta.get(codec).map(|_| true),
    };
    match (flag("hasAudio", "audiocodecid"), flag("hasVideo", "videocodecid")) {
        (None, None) => None,
        (audio, video) => Some((audio.unwrap_or(false), video.unwrap_or(false))),
    }
}

fn put_flv_tag(out: &mut BytesMut, tag_type: u8, timestamp: u32, data: &[u8]) {
    let size = u32::try_from(data.len()).unwrap_or(u32::MAX) & 0x00ff_ffff;
    let ts = timestamp.to_be_bytes();
    out.put_u8(tag_type);
    out.put_slice(&size.to_be_bytes()[1..]);
    out.put_slice(&ts[1..]);
    out.put_u8(ts[0]);
    out.put_slice(&[0, 0, 0]);
    out.put_slice(&data[..size as usize]);
    out.put_u32(size + FLV_TAG_HEADER_LEN as u32);
}

/// Sub-messages of an aggregate: `(type, timestamp, body)`, laid out like FLV tags.
fn aggregate_parts(payload: &[u8]) -> impl Iterator<Item = (u8, u32, &[u8])> {
    let mut rest = payload;
    std::iter::from_fn(move || {
        if rest.len() < FLV_TAG_HEADER_LEN {
            return None;
        }
        let size = (usize::from(rest[1]) << 16) | (usize::from(rest[2]) << 8) | usize::from(rest[3]);
        let timestamp = u32::from_be_bytes([rest[7], rest[4], rest[5], rest[6]]);
        let end = FLV_TAG_HEADER_LEN + size;
        if rest.len() < end {
            return None;
        }
        let part = (rest[0] & 0x1f, timestamp, &rest[FLV_TAG_HEADER_LEN..end]);
        rest = rest.get(end + 4..).unwrap_or_default();
        Some(part)
    })
}

fn aggregate_kinds(payload: &[u8]) -> (bool, bool) {
    aggregate_parts(payload).fold((false, false), |(a, v), (kind, _, _)| {
        (a || kind == message_type::AUDIO, v || kind == message_type::VIDEO)
    })
}

/// Appends `message` as FLV tags. Aggregate sub-messages are rebased onto the
/// aggregate's own timestamp.
fn append_tags(message: &RtmpMessage, out: &mut BytesMut) {
    match message.type_id {
        message_type::AUDIO | message_type::VIDEO => {
            put_flv_tag(out, message.type_id, message.timestamp, &message.payload);
        },
        message_type::DATA_AMF0 => {
            // Publishers wrap metadata in @setDataFrame; FLV files carry it bare.
            let body = match amf0::decode_all(&message.payload) {
                Ok(values) if values.first().and_then(Amf0Value::as_str) == Some("@setDataFrame") => {
                    amf0::encode(&values[1..])
                },
                _ => message.payload.clone(),
            };
            put_flv_tag(out, message_type::DATA_AMF0, message.timestamp, &body);
        },
        message_type::AGGREGATE => {
            let mut base = None;
            for (kind, timestamp, body) in aggregate_parts(&message.payload) {
                let first = *base.get_or_insert(timestamp);
                let rebased = message.timestamp.wrapping_add(timestamp.wrapping_sub(first));
                put_flv_tag(out, kind, rebased, body);
            }
        },
        _ => {},
    }
}
