// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Client-side RTMP play session: handshake, `connect`, `createStream`, `play`, then a
//! stream of audio, video and data messages with protocol control handled inline.

use super::amf0::{self, Amf0Value};
use super::chunk::{csid, message_type, ChunkReader, ChunkWriter, RtmpMessage};
use super::handshake::client_handshake;
use bytes::{Buf, BytesMut};
use mediacore_core::{MediaCoreError, Result, SourceUri};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk size announced to the server.
const OUTBOUND_CHUNK_SIZE: u32 = 4096;
const WINDOW_ACK_SIZE: u32 = 2_500_000;
/// Client-side buffer advertised before `play`.
const BUFFER_LENGTH_MS: u32 = 3000;
/// Chunk stream used for messages on the play stream.
const STREAM_CSID: u32 = 8;
const FLASH_VERSION: &str = "LNX 9,0,124,2";

mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const SET_BUFFER_LENGTH: u16 = 3;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

/// Where to connect and what to play, split out of an `rtmp://host[:port]/app/stream` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    /// Stream name, with the query string if one was given.
    pub stream: String,
    pub tc_url: String,
}

impl RtmpUrl {
    /// # Errors
    ///
    /// `InvalidArgument` when the host, app or stream name is missing.
    pub fn parse(uri: &SourceUri) -> Result<Self> {
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MediaCoreError::InvalidArgument(format!("missing host in {uri}")))?
            .to_string();
        let port = uri.port_or_default().unwrap_or(1935);
        let path = uri.path().trim_start_matches('/');
        let (app, stream) = path
            .split_once('/')
            .filter(|(app, stream)| !app.is_empty() && !stream.is_empty())
            .ok_or_else(|| {
                MediaCoreError::InvalidArgument(format!("expected rtmp://host/app/stream, got {uri}"))
            })?;
        let stream = match uri.as_url().query() {
            Some(query) => format!("{stream}?{query}"),
            None => stream.to_string(),
        };
        Ok(Self { tc_url: format!("rtmp://{host}:{port}/{app}"), host, port, app: app.to_string(), stream })
    }
}

/// An established play session.
pub struct RtmpSession<S> {
    socket: S,
    reader: ChunkReader,
    writer: ChunkWriter,
    read_size: usize,
    received: u64,
    acked: u64,
    ack_window: Option<u32>,
    transaction: f64,
    stream_id: u32,
    ended: bool,
    /// Media that arrived before `NetStream.Play.Start`.
    early: VecDeque<RtmpMessage>,
}

fn command(values: &[Amf0Value], stream_id: u32) -> RtmpMessage {
    RtmpMessage::new(message_type::COMMAND_AMF0, stream_id, 0, amf0::encode(values))
}

fn user_control_message(event: u16, data: &[u8]) -> RtmpMessage {
    let mut payload = event.to_be_bytes().to_vec();
    payload.extend_from_slice(data);
    RtmpMessage::new(message_type::USER_CONTROL, 0, 0, payload)
}

/// `_error` results and error-level `onStatus` replies.
fn rejection(values: &[Amf0Value], step: &str) -> MediaCoreError {
    let info = values.get(3);
    let code = info.and_then(|i| i.get("code")).and_then(Amf0Value::as_str).unwrap_or("unknown");
    let description = info.and_then(|i| i.get("description")).and_then(Amf0Value::as_str).unwrap_or("");
    MediaCoreError::Network(format!("RTMP {step} rejected: {code} {description}").trim_end().to_string())
}

enum Inbound {
    Media(RtmpMessage),
    Command(Vec<Amf0Value>),
    Closed,
}

impl<S> RtmpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Handshakes, connects to the application and starts playing the stream.
    ///
    /// # Errors
    ///
    /// `Network` on socket failure, a malformed chunk stream, or when the server rejects
    /// a command or closes before playback starts.
    pub async fn play(mut socket: S, url: &RtmpUrl, read_size: usize) -> Result<Self> {
        client_handshake(&mut socket).await?;
        let mut session = Self {
            socket,
            reader: ChunkReader::new(),
            writer: ChunkWriter::new(),
            read_size: read_size.max(1),
            received: 0,
            acked: 0,
            ack_window: None,
            transaction: 0.0,
            stream_id: 0,
            ended: false,
            early: VecDeque::new(),
        };

        session.send(csid::PROTOCOL_CONTROL, &RtmpMessage::set_chunk_size(OUTBOUND_CHUNK_SIZE)).await?;
        session.writer.set_chunk_size(OUTBOUND_CHUNK_SIZE as usize);

        let txn = session.next_transaction();
        let connect = command(
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(txn),
                Amf0Value::object([
                    ("app", Amf0Value::String(url.app.clone())),
                    ("flashVer", Amf0Value::String(FLASH_VERSION.into())),
                    ("tcUrl", Amf0Value::String(url.tc_url.clone())),
                    ("fpad", Amf0Value::Boolean(false)),
                    ("capabilities", Amf0Value::Number(15.0)),
                    ("audioCodecs", Amf0Value::Number(3191.0)),
                    ("videoCodecs", Amf0Value::Number(252.0)),
                    ("videoFunction", Amf0Value::Number(1.0)),
                    ("objectEncoding", Amf0Value::Number(0.0)),
                ]),
            ],
            0,
        );
        session.send(csid::COMMAND, &connect).await?;
        session.await_result(txn, "connect").await?;
        tracing::debug!(app = %url.app, "RTMP connect accepted");

        session.send(csid::PROTOCOL_CONTROL, &RtmpMessage::window_ack_size(WINDOW_ACK_SIZE)).await?;
        let txn = session.next_transaction();
        session
            .send(
                csid::COMMAND,
                &command(&[Amf0Value::String("createStream".into()), Amf0Value::Number(txn), Amf0Value::Null], 0),
            )
            .await?;
        let reply = session.await_result(txn, "createStream").await?;
        let stream_id = reply.get(3).and_then(Amf0Value::as_number).ok_or_else(|| {
            MediaCoreError::Network("RTMP createStream result carries no stream id".to_string())
        })?;
        session.stream_id = stream_id as u32;

        let mut buffer = session.stream_id.to_be_bytes().to_vec();
        buffer.extend_from_slice(&BUFFER_LENGTH_MS.to_be_bytes());
        session.send(csid::PROTOCOL_CONTROL, &user_control_message(user_control::SET_BUFFER_LENGTH, &buffer)).await?;

        let play = command(
            &[
                Amf0Value::String("play".into()),
                Amf0Value::Number(0.0),
                Amf0Value::Null,
                Amf0Value::String(url.stream.clone()),
                // Live if available, else recorded from the start.
                Amf0Value::Number(-2.0),
            ],
            session.stream_id,
        );
        session.send(STREAM_CSID, &play).await?;
        session.await_play_start(&url.stream).await?;
        tracing::info!(stream = %url.stream, stream_id = session.stream_id, "RTMP playback started");
        Ok(session)
    }

    fn next_transaction(&mut self) -> f64 {
        self.transaction += 1.0;
        self.transaction
    }

    async fn send(&mut self, csid: u32, message: &RtmpMessage) -> Result<()> {
        let mut out = BytesMut::new();
        self.writer.write(csid, message, &mut out);
        self.socket.write_all(&out).await.map_err(|e| MediaCoreError::Network(format!("RTMP write: {e}")))?;
        self.socket.flush().await.map_err(|e| MediaCoreError::Network(format!("RTMP write: {e}")))
    }

    /// Waits for the `_result` of transaction `txn`.
    async fn await_result(&mut self, txn: f64, step: &str) -> Result<Vec<Amf0Value>> {
        loop {
            match self.read_inbound().await? {
                Inbound::Closed => {
                    return Err(MediaCoreError::Network(format!("RTMP server closed during {step}")));
                },
                Inbound::Media(message) => self.early.push_back(message),
                Inbound::Command(values) => {
                    let name = values.first().and_then(Amf0Value::as_str);
                    let id = values.get(1).and_then(Amf0Value::as_number);
                    match (name, id) {
                        (Some("_result"), Some(id)) if (id - txn).abs() < f64::EPSILON => return Ok(values),
                        (Some("_error"), Some(id)) if (id - txn).abs() < f64::EPSILON => {
                            return Err(rejection(&values, step));
                        },
                        _ => tracing::trace!(?name, "RTMP command ignored while waiting for {step}"),
                    }
                },
            }
        }
    }

    /// Waits for `NetStream.Play.Start`; media that shows up first also counts as started.
    async fn await_play_start(&mut self, stream: &str) -> Result<()> {
        loop {
            if !self.early.is_empty() {
                return Ok(());
            }
            match self.read_inbound().await? {
                Inbound::Closed => {
                    return Err(MediaCoreError::Network(format!("RTMP server closed before playing {stream}")));
                },
                Inbound::Media(message) => self.early.push_back(message),
                Inbound::Command(values) => {
                    if values.first().and_then(Amf0Value::as_str) != Some("onStatus") {
                        continue;
                    }
                    let info = values.get(3);
                    let level = info.and_then(|i| i.get("level")).and_then(Amf0Value::as_str);
                    let code = info.and_then(|i| i.get("code")).and_then(Amf0Value::as_str).unwrap_or("");
                    if level == Some("error") || code == "NetStream.Play.StreamNotFound" {
                        return Err(rejection(&values, "play"));
                    }
                    tracing::debug!(code, "RTMP stream status");
                    if code == "NetStream.Play.Start" {
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Next audio, video or data message on the play stream; `None` once the server
    /// stops the stream or closes the connection.
    ///
    /// # Errors
    ///
    /// `Network` on socket failure or a malformed chunk stream.
    pub async fn next_media(&mut self) -> Result<Option<RtmpMessage>> {
        if let Some(message) = self.early.pop_front() {
            return Ok(Some(message));
        }
        while !self.ended {
            match self.read_inbound().await? {
                Inbound::Media(message) => return Ok(Some(message)),
                Inbound::Closed => self.ended = true,
                Inbound::Command(values) => {
                    let name = values.first().and_then(Amf0Value::as_str);
                    let code = values.get(3).and_then(|i| i.get("code")).and_then(Amf0Value::as_str);
                    if let (Some("onStatus"), Some(code)) = (name, code) {
                        tracing::debug!(code, "RTMP stream status");
                        if matches!(code, "NetStream.Play.Stop" | "NetStream.Play.Complete" | "NetStream.Play.UnpublishNotify") {
                            self.ended = true;
                        }
                    }
                },
            }
        }
        Ok(None)
    }

    /// Reads until one application-level message is available, answering protocol
    /// control messages along the way.
    async fn read_inbound(&mut self) -> Result<Inbound> {
        loop {
            while let Some(message) = self.reader.next_message()? {
                if let Some(inbound) = self.on_message(message).await? {
                    return Ok(inbound);
                }
            }

            let mut buf = vec![0u8; self.read_size];
            let n = self
                .socket
                .read(&mut buf)
                .await
                .map_err(|e| MediaCoreError::Network(format!("reading RTMP session: {e}")))?;
            if n == 0 {
                return Ok(Inbound::Closed);
            }
            self.reader.push(&buf[..n]);
            self.received += n as u64;
            if let Some(window) = self.ack_window {
                if self.received - self.acked >= u64::from(window) {
                    self.acked = self.received;
                    // The sequence number wraps at 32 bits.
                    let sequence = (self.received & u64::from(u32::MAX)) as u32;
                    self.send(csid::PROTOCOL_CONTROL, &RtmpMessage::acknowledgement(sequence)).await?;
                }
            }
        }
    }

    async fn on_message(&mut self, message: RtmpMessage) -> Result<Option<Inbound>> {
        let mut payload = message.payload.clone();
        match message.type_id {
            message_type::SET_CHUNK_SIZE if payload.len() >= 4 => {
                self.reader.set_chunk_size(payload.get_u32() & 0x7fff_ffff)?;
            },
            message_type::ABORT if payload.len() >= 4 => self.reader.abort(payload.get_u32()),
            message_type::WINDOW_ACK_SIZE if payload.len() >= 4 => {
                let window = payload.get_u32();
                tracing::trace!(window, "RTMP window acknowledgement size");
                self.ack_window = Some(window.max(1));
            },
            message_type::SET_PEER_BANDWIDTH => {
                self.send(csid::PROTOCOL_CONTROL, &RtmpMessage::window_ack_size(WINDOW_ACK_SIZE)).await?;
            },
            message_type::USER_CONTROL if payload.len() >= 2 => match payload.get_u16() {
                user_control::PING_REQUEST => {
                    let reply = user_control_message(user_control::PING_RESPONSE, &payload);
                    self.send(csid::PROTOCOL_CONTROL, &reply).await?;
                },
                user_control::STREAM_BEGIN => tracing::trace!("RTMP stream begin"),
                user_control::STREAM_EOF => tracing::debug!("RTMP stream EOF"),
                other => tracing::trace!(event = other, "RTMP user control event ignored"),
            },
            message_type::COMMAND_AMF0 => return Ok(Some(Inbound::Command(amf0::decode_all(&payload)?))),
            message_type::AUDIO | message_type::VIDEO | message_type::DATA_AMF0 | message_type::AGGREGATE => {
                return Ok(Some(Inbound::Media(message)));
            },
            other => tracing::trace!(type_id = other, "RTMP message ignored"),
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn splits_app_and_stream() {
        let url = RtmpUrl::parse(&SourceUri::parse("rtmp://media.example/live/cam/1?token=abc").unwrap()).unwrap();
        assert_eq!(url.port, 1935);
        assert_eq!(url.app, "live");
        assert_eq!(url.stream, "cam/1?token=abc");
        assert_eq!(url.tc_url, "rtmp://media.example:1935/live");

        assert!(RtmpUrl::parse(&SourceUri::parse("rtmp://media.example/live").unwrap()).is_err());
        assert!(RtmpUrl::parse(&SourceUri::parse("rtmp://media.example/live/").unwrap()).is_err());
    }
}
