// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! RTMP chunk stream: splits messages into chunks on send and reassembles them on receive.
//!
//! ```text
//! +--------------+----------------+--------------------+------------+
//! | Basic Header | Message Header | Extended Timestamp | Chunk Data |
//! +--------------+----------------+--------------------+------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mediacore_core::{MediaCoreError, Result};
use std::collections::HashMap;

pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Largest chunk size either side may announce.
pub const MAX_CHUNK_SIZE: usize = 0x00ff_ffff;
const EXTENDED_TIMESTAMP: u32 = 0x00ff_ffff;
const MAX_CHUNK_STREAMS: usize = 256;

pub mod message_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

/// Chunk stream ids used for outgoing messages.
pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub stream_id: u32,
    /// Milliseconds.
    pub timestamp: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(type_id: u8, stream_id: u32, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self { type_id, stream_id, timestamp, payload: payload.into() }
    }

    pub fn set_chunk_size(size: u32) -> Self {
        Self::new(message_type::SET_CHUNK_SIZE, 0, 0, size.to_be_bytes().to_vec())
    }

    pub fn window_ack_size(size: u32) -> Self {
        Self::new(message_type::WINDOW_ACK_SIZE, 0, 0, size.to_be_bytes().to_vec())
    }

    pub fn acknowledgement(sequence: u32) -> Self {
        Self::new(message_type::ACKNOWLEDGEMENT, 0, 0, sequence.to_be_bytes().to_vec())
    }
}

/// Per chunk stream header state; later chunks inherit omitted fields.
#[derive(Debug, Default)]
struct ChunkStream {
    started: bool,
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    partial: BytesMut,
}

/// Incremental chunk parser. Bytes are pushed as they arrive and whole messages come out.
#[derive(Debug)]
pub struct ChunkReader {
    buf: BytesMut,
    chunk_size: usize,
    streams: HashMap<u32, ChunkStream>,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

fn u24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

fn malformed(what: impl std::fmt::Display) -> MediaCoreError {
    MediaCoreError::Network(format!("malformed RTMP chunk stream: {what}"))
}

impl ChunkReader {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), chunk_size: DEFAULT_CHUNK_SIZE, streams: HashMap::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Applies a peer's Set Chunk Size.
    ///
    /// # Errors
    ///
    /// `Network` if the size is zero or out of range.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        let size = size as usize;
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(malformed(format!("chunk size {size}")));
        }
        tracing::trace!(size, "RTMP inbound chunk size changed");
        self.chunk_size = size;
        Ok(())
    }

    /// Drops the partially received message on `csid`.
    pub fn abort(&mut self, csid: u32) {
        if let Some(stream) = self.streams.get_mut(&csid) {
            stream.partial.clear();
        }
    }

    /// Next complete message, or `None` until more bytes are pushed.
    ///
    /// # Errors
    ///
    /// `Network` when the byte stream cannot be a valid chunk stream.
    pub fn next_message(&mut self) -> Result<Option<RtmpMessage>> {
        loop {
            match self.read_chunk()? {
                None => return Ok(None),
                Some(Some(message)) => return Ok(Some(message)),
                Some(None) => {},
            }
        }
    }

    /// Consumes one chunk if it is fully buffered. The inner `None` means the chunk
    /// was a fragment of a larger message.
    fn read_chunk(&mut self) -> Result<Option<Option<RtmpMessage>>> {
        let Self { buf, chunk_size, streams } = self;
        let Some(&first) = buf.first() else { return Ok(None) };
        let fmt = first >> 6;
        let (csid, mut pos) = match first & 0x3f {
            0 if buf.len() >= 2 => (64 + u32::from(buf[1]), 2),
            1 if buf.len() >= 3 => (64 + u32::from(buf[1]) + 256 * u32::from(buf[2]), 3),
            0 | 1 => return Ok(None),
            id => (u32::from(id), 1),
        };
        let header_len = [11, 7, 3, 0][usize::from(fmt)];
        if buf.len() < pos + header_len {
            return Ok(None);
        }

        if !streams.contains_key(&csid) && streams.len() >= MAX_CHUNK_STREAMS {
            return Err(malformed("too many chunk streams"));
        }
        let stream = streams.entry(csid).or_default();
        if fmt != 0 && !stream.started {
            return Err(malformed(format!("chunk stream {csid} starts with format {fmt}")));
        }

        let header = &buf[pos..pos + header_len];
        let mut length = stream.length;
        let mut type_id = stream.type_id;
        let mut stream_id = stream.stream_id;
        let ts_field = match fmt {
            0 => {
                length = u24(&header[3..6]) as usize;
                type_id = header[6];
                stream_id = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
                Some(u24(&header[0..3]))
            },
            1 => {
                length = u24(&header[3..6]) as usize;
                type_id = header[6];
                Some(u24(&header[0..3]))
            },
            2 => Some(u24(&header[0..3])),
            _ => None,
        };
        pos += header_len;

        let extended = ts_field.map_or(stream.extended, |t| t >= EXTENDED_TIMESTAMP);
        let ts_value = if extended {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let value = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            pos += 4;
            value
        } else {
            ts_field.unwrap_or(stream.delta)
        };

        let starting = stream.partial.is_empty();
        if !starting && fmt != 3 {
            tracing::debug!(csid, fmt, "RTMP message interrupted by a new header");
            stream.partial.clear();
        }
        let received = stream.partial.len();
        if received > length {
            return Err(malformed(format!("chunk stream {csid} overran its message length")));
        }
        let take = (length - received).min(*chunk_size);
        if buf.len() < pos + take {
            return Ok(None);
        }

        // Chunk fully buffered; commit.
        if stream.partial.is_empty() {
            match fmt {
                0 => {
                    stream.timestamp = ts_value;
                    stream.delta = 0;
                },
                1 | 2 => {
                    stream.delta = ts_value;
                    stream.timestamp = stream.timestamp.wrapping_add(ts_value);
                },
                _ => stream.timestamp = stream.timestamp.wrapping_add(stream.delta),
            }
        }
        stream.started = true;
        stream.extended = extended;
        stream.length = length;
        stream.type_id = type_id;
        stream.stream_id = stream_id;

        buf.advance(pos);
        stream.partial.extend_from_slice(&buf.split_to(take));
        if stream.partial.len() < length {
            return Ok(Some(None));
        }
        let payload = stream.partial.split().freeze();
        Ok(Some(Some(RtmpMessage { type_id, stream_id, timestamp: stream.timestamp, payload })))
    }
}

/// Splits outgoing messages into chunks of the negotiated size.
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_size: usize,
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn put_basic_header(out: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => out.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            out.put_u8(fmt << 6);
            out.put_u8((csid - 64) as u8);
        },
        _ => {
            let id = csid.saturating_sub(64).min(0xffff);
            out.put_u8((fmt << 6) | 1);
            out.put_u16_le(id as u16);
        },
    }
}

impl ChunkWriter {
    pub const fn new() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Appends `message` to `out` as one type-0 chunk followed by type-3 continuations.
    pub fn write(&self, csid: u32, message: &RtmpMessage, out: &mut BytesMut) {
        let extended = message.timestamp >= EXTENDED_TIMESTAMP;
        let ts_field = if extended { EXTENDED_TIMESTAMP } else { message.timestamp };
        let length = u32::try_from(message.payload.len()).unwrap_or(u32::MAX).min(EXTENDED_TIMESTAMP);

        put_basic_header(out, 0, csid);
        out.put_slice(&ts_field.to_be_bytes()[1..]);
        out.put_slice(&length.to_be_bytes()[1..]);
        out.put_u8(message.type_id);
        out.put_u32_le(message.stream_id);
        if extended {
            out.put_u32(message.timestamp);
        }

        let mut chunks = message.payload[..length as usize].chunks(self.chunk_size);
        if let Some(first) = chunks.next() {
            out.put_slice(first);
        }
        for chunk in chunks {
            put_basic_header(out, 3, csid);
            if extended {
                out.put_u32(message.timestamp);
            }
            out.put_slice(chunk);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn drain(reader: &mut ChunkReader) -> Vec<RtmpMessage> {
        let mut out = Vec::new();
        while let Some(m) = reader.next_message().unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn reassembles_large_messages_fed_byte_by_byte() {
        let video = RtmpMessage::new(message_type::VIDEO, 1, 40, vec![7u8; 300]);
        let audio = RtmpMessage::new(message_type::AUDIO, 1, 0xff_ffff + 5, vec![1u8; 130]);
        let mut writer = ChunkWriter::new();
        let mut wire = BytesMut::new();
        writer.write(6, &video, &mut wire);
        let video_len = wire.len();
        writer.set_chunk_size(64);
        writer.write(300, &audio, &mut wire);

        let mut reader = ChunkReader::new();
        let mut got = Vec::new();
        for (i, byte) in wire.iter().enumerate() {
            reader.push(&[*byte]);
            if i + 1 == video_len {
                // Set Chunk Size takes effect after the message that carried it.
                got.extend(drain(&mut reader));
                reader.set_chunk_size(64).unwrap();
            }
            got.extend(drain(&mut reader));
        }
        assert_eq!(got, vec![video, audio]);
    }

    #[test]
    fn compressed_headers_inherit_fields_and_accumulate_deltas() {
        let mut wire = vec![
            // fmt 0, csid 4, ts 1000, len 2, audio, stream 1
            0x04, 0x00, 0x03, 0xe8, 0x00, 0x00, 0x02, 0x08, 0x01, 0x00, 0x00, 0x00, 0xaa, 0xbb,
            // fmt 1, delta 20, len 1, audio
            0x44, 0x00, 0x00, 0x14, 0x00, 0x00, 0x01, 0x08, 0xcc,
            // fmt 2, delta 23
            0x84, 0x00, 0x00, 0x17, 0xdd,
        ];
        // fmt 3 repeats the last delta.
        wire.extend_from_slice(&[0xc4, 0xee]);

        let mut reader = ChunkReader::new();
        reader.push(&wire);
        let got = drain(&mut reader);
        assert_eq!(got.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![1000, 1020, 1043, 1066]);
        assert!(got.iter().all(|m| m.stream_id == 1 && m.type_id == message_type::AUDIO));
        assert_eq!(got[3].payload.as_ref(), &[0xee]);
    }

    #[test]
    fn interleaved_chunk_streams_keep_separate_state() {
        let a = RtmpMessage::new(message_type::VIDEO, 1, 0, vec![1u8; 200]);
        let b = RtmpMessage::new(message_type::AUDIO, 1, 0, vec![2u8; 10]);
        let writer = ChunkWriter::new();
        let mut a_wire = BytesMut::new();
        writer.write(6, &a, &mut a_wire);
        let mut b_wire = BytesMut::new();
        writer.write(4, &b, &mut b_wire);

        // First chunk of `a`, all of `b`, then the rest of `a`.
        let split = 12 + DEFAULT_CHUNK_SIZE;
        let mut reader = ChunkReader::new();
        reader.push(&a_wire[..split]);
        reader.push(&b_wire);
        reader.push(&a_wire[split..]);
        assert_eq!(drain(&mut reader), vec![b, a]);
    }

    #[test]
    fn continuation_without_header_is_rejected() {
        let mut reader = ChunkReader::new();
        reader.push(&[0xc5, 0x00]);
        assert!(reader.next_message().is_err());
        assert!(ChunkReader::new().set_chunk_size(0).is_err());
    }
}
