// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MPEG transport stream demuxer (ITU-T H.222.0).
//!
//! ```text
//! Packet (188): | 0x47 | PUSI + PID (13 bits) | adaptation ctrl + continuity | [adaptation] | payload |
//!
//! PAT (PID 0)  → program_number / PMT PID pairs
//! PMT          → (stream_type, elementary PID) pairs
//! PES          → | 00 00 01 | stream id | length (2) | flags (2) | header len | PTS/DTS | data |
//! ```
//!
//! Only the first program is played. PSI sections must fit in a single packet, which holds
//! for every muxer in practice. Streams register on their first complete PES so AAC can
//! report its sample rate from the ADTS header.

use super::demux::Demuxer;
use bytes::{Buf, Bytes, BytesMut};
use mediacore_core::{CodecId, EncodedPacket, MediaCoreError, MediaKind, Result, StreamDescriptor};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const NULL_PID: u16 = 0x1fff;

mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

mod stream_type {
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const MPEG2_AUDIO: u8 = 0x04;
    pub const AAC_ADTS: u8 = 0x0f;
    pub const H264: u8 = 0x1b;
    pub const HEVC: u8 = 0x24;
}

const ADTS_SAMPLE_RATES: [u32; 13] =
    [96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350];

/// CRC-32/MPEG-2 as used by PSI sections. A section including its CRC sums to zero.
pub(crate) fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffff_u32;
    for byte in data {
        crc ^= u32::from(*byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04c1_1db7 } else { crc << 1 };
        }
    }
    crc
}

/// 90 kHz ticks to microseconds.
const fn ticks_to_us(ticks: u64) -> u64 {
    ticks * 100 / 9
}

fn read_timestamp(b: &[u8]) -> u64 {
    (u64::from(b[0] >> 1) & 0x07) << 30
        | u64::from(b[1]) << 22
        | u64::from(b[2] >> 1) << 15
        | u64::from(b[3]) << 7
        | u64::from(b[4] >> 1)
}

struct PesHeader {
    pts: Option<u64>,
    dts: Option<u64>,
    payload_offset: usize,
}

impl PesHeader {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 9 || data[..3] != [0, 0, 1] {
            return None;
        }
        let flags = data[7];
        let payload_offset = 9 + usize::from(data[8]);
        if data.len() < payload_offset {
            return None;
        }
        let pts = (flags & 0x80 != 0 && data.len() >= 14).then(|| read_timestamp(&data[9..14]));
        let dts = (flags & 0xc0 == 0xc0 && data.len() >= 19).then(|| read_timestamp(&data[14..19]));
        Some(Self { pts, dts, payload_offset })
    }
}

/// Total PES size when the header declares it (video usually leaves it zero).
fn declared_pes_len(pes: &[u8]) -> Option<usize> {
    if pes.len() < 6 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([pes[4], pes[5]]));
    (len > 0).then_some(6 + len)
}

/// Sample rate and channel count from a leading ADTS header.
fn adts_format(payload: &[u8]) -> (Option<u32>, Option<u16>) {
    if payload.len() < 7 || payload[0] != 0xff || payload[1] & 0xf0 != 0xf0 {
        return (None, None);
    }
    let rate = ADTS_SAMPLE_RATES.get(usize::from((payload[2] >> 2) & 0x0f)).copied();
    let channels = (u16::from(payload[2] & 0x01) << 2) | u16::from(payload[3] >> 6);
    (rate, (channels > 0).then_some(channels))
}

/// Whether an Annex B access unit carries a random access point.
fn has_irap(codec: &CodecId, data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let header = data[i + 3];
            let irap = match codec {
                CodecId::H264 => header & 0x1f == 5,
                CodecId::Hevc => (16..=21).contains(&((header >> 1) & 0x3f)),
                _ => false,
            };
            if irap {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

#[derive(Debug)]
struct Elementary {
    kind: MediaKind,
    codec: CodecId,
    stream_index: Option<usize>,
    pes: BytesMut,
    random_access: bool,
    continuity: Option<u8>,
}

/// See the module docs.
#[derive(Debug, Default)]
pub struct TsDemuxer {
    buf: BytesMut,
    synced: bool,
    pmt_pid: Option<u16>,
    elementary: HashMap<u16, Elementary>,
    announced: Option<SmallVec<[MediaKind; 2]>>,
    streams: Vec<StreamDescriptor>,
    ready: VecDeque<EncodedPacket>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines the buffer up on a sync byte. Returns false until a whole packet is buffered.
    fn align(&mut self) -> Result<bool> {
        match self.buf.iter().position(|b| *b == SYNC_BYTE) {
            Some(0) => {},
            Some(_) | None if !self.synced && !self.buf.is_empty() => {
                return Err(MediaCoreError::Unsupported("not an MPEG-TS stream".to_string()));
            },
            Some(skip) => {
                tracing::debug!(skip, "Lost MPEG-TS sync, skipping to next sync byte");
                self.buf.advance(skip);
            },
            None => {
                self.buf.clear();
                return Ok(false);
            },
        }
        if self.buf.len() < TS_PACKET_SIZE {
            return Ok(false);
        }
        self.synced = true;
        Ok(true)
    }

    fn parse_packet(&mut self, packet: &[u8]) {
        let start = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2]);
        let adaptation = (packet[3] >> 4) & 0x03;
        let continuity = packet[3] & 0x0f;
        if pid == NULL_PID {
            return;
        }

        let mut offset = 4;
        let mut random_access = false;
        if adaptation & 0x02 != 0 {
            let len = usize::from(packet[4]);
            random_access = len > 0 && packet[5] & 0x40 != 0;
            offset += 1 + len;
        }
        if adaptation & 0x01 == 0 || offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if pid == PAT_PID {
            if let Some(section) = psi_section(payload, start, table_id::PAT) {
                self.on_pat(section);
            }
        } else if Some(pid) == self.pmt_pid {
            if let Some(section) = psi_section(payload, start, table_id::PMT) {
                self.on_pmt(section);
            }
        } else if self.elementary.contains_key(&pid) {
            self.on_pes_payload(pid, payload, start, continuity, random_access);
        }
    }

    fn on_pat(&mut self, section: &[u8]) {
        let entries = &section[8..section.len() - 4];
        for entry in entries.chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            // Program 0 points at the network information table.
            if program != 0 {
                let pid = u16::from_be_bytes([entry[2], entry[3]]) & 0x1fff;
                if self.pmt_pid != Some(pid) {
                    tracing::trace!(program, pid, "MPEG-TS program map located");
                    self.pmt_pid = Some(pid);
                }
                return;
            }
        }
    }

    fn on_pmt(&mut self, section: &[u8]) {
        if section.len() < 16 {
            return;
        }
        let program_info_len = usize::from(u16::from_be_bytes([section[10], section[11]]) & 0x0fff);
        let end = section.len() - 4;
        let mut pos = 12 + program_info_len;
        while pos + 5 <= end {
            let kind_code = section[pos];
            let pid = u16::from_be_bytes([section[pos + 1], section[pos + 2]]) & 0x1fff;
            let es_info_len = usize::from(u16::from_be_bytes([section[pos + 3], section[pos + 4]]) & 0x0fff);
            pos += 5 + es_info_len;

            let (kind, codec) = match kind_code {
                stream_type::H264 => (MediaKind::Video, CodecId::H264),
                stream_type::HEVC => (MediaKind::Video, CodecId::Hevc),
                stream_type::AAC_ADTS => (MediaKind::Audio, CodecId::Aac),
                stream_type::MPEG1_AUDIO | stream_type::MPEG2_AUDIO => (MediaKind::Audio, CodecId::Mp3),
                other => {
                    tracing::trace!(pid, stream_type = other, "Ignoring MPEG-TS elementary stream");
                    continue;
                },
            };
            self.elementary.entry(pid).or_insert_with(|| Elementary {
                kind,
                codec,
                stream_index: None,
                pes: BytesMut::new(),
                random_access: false,
                continuity: None,
            });
        }

        let mut kinds: SmallVec<[MediaKind; 2]> = SmallVec::new();
        let mut pids: Vec<&u16> = self.elementary.keys().collect();
        pids.sort_unstable();
        for pid in pids {
            let kind = self.elementary[pid].kind;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        self.announced = Some(kinds);
    }

    fn on_pes_payload(&mut self, pid: u16, payload: &[u8], start: bool, continuity: u8, random_access: bool) {
        let Some(es) = self.elementary.get_mut(&pid) else { return };
        match es.continuity {
            // Duplicate packets are allowed once and carry the same payload.
            Some(last) if last == continuity => return,
            Some(last) if (last + 1) & 0x0f != continuity => {
                tracing::debug!(pid, expected = (last + 1) & 0x0f, got = continuity, "MPEG-TS continuity gap");
                es.pes.clear();
            },
            _ => {},
        }
        es.continuity = Some(continuity);

        let mut complete: SmallVec<[(Bytes, bool); 2]> = SmallVec::new();
        if start {
            if !es.pes.is_empty() {
                complete.push((es.pes.split().freeze(), es.random_access));
            }
            es.random_access = random_access;
        } else if es.pes.is_empty() {
            // Joined mid-PES; wait for the next unit start.
            return;
        }
        es.pes.extend_from_slice(payload);
        if declared_pes_len(&es.pes).is_some_and(|len| es.pes.len() >= len) {
            complete.push((es.pes.split().freeze(), es.random_access));
        }

        for (pes, random_access) in complete {
            self.on_pes(pid, &pes, random_access);
        }
    }

    fn on_pes(&mut self, pid: u16, pes: &Bytes, random_access: bool) {
        let Some((kind, codec, index)) =
            self.elementary.get(&pid).map(|es| (es.kind, es.codec.clone(), es.stream_index))
        else {
            return;
        };
        let Some(header) = PesHeader::parse(pes) else {
            tracing::trace!(pid, "Skipping malformed PES");
            return;
        };
        let Some(ticks) = header.pts.or(header.dts) else {
            tracing::trace!(pid, "Skipping PES without timestamp");
            return;
        };
        let mut end = pes.len();
        if let Some(len) = declared_pes_len(pes) {
            end = end.min(len);
        }
        if header.payload_offset >= end {
            return;
        }
        let data = pes.slice(header.payload_offset..end);

        let stream_index = match index {
            Some(index) => index,
            None => {
                let index = self.streams.len();
                let (sample_rate, channels) =
                    if codec == CodecId::Aac { adts_format(&data) } else { (None, None) };
                self.streams.push(StreamDescriptor {
                    index,
                    kind,
                    codec: codec.clone(),
                    sample_rate,
                    channels,
                    width: None,
                    height: None,
                });
                if let Some(es) = self.elementary.get_mut(&pid) {
                    es.stream_index = Some(index);
                }
                index
            },
        };

        let keyframe = match kind {
            MediaKind::Audio => true,
            MediaKind::Video => random_access || has_irap(&codec, &data),
        };
        self.ready.push_back(EncodedPacket {
            kind,
            stream_index,
            codec,
            timestamp_us: ticks_to_us(ticks),
            duration_us: None,
            keyframe,
            data,
        });
    }
}

/// The section in a unit-start payload, CRC-checked.
fn psi_section(payload: &[u8], start: bool, table: u8) -> Option<&[u8]> {
    if !start {
        return None;
    }
    let pointer = usize::from(*payload.first()?);
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 || section[0] != table {
        return None;
    }
    let section_len = usize::from(u16::from_be_bytes([section[1], section[2]]) & 0x0fff);
    let section = section.get(..3 + section_len)?;
    if section.len() < 12 {
        return None;
    }
    if crc32_mpeg2(section) != 0 {
        tracing::debug!(table, "Dropping PSI section with bad CRC");
        return None;
    }
    Some(section)
}

impl Demuxer for TsDemuxer {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            if !self.align()? {
                return Ok(None);
            }
            let packet = self.buf.split_to(TS_PACKET_SIZE);
            self.parse_packet(&packet);
        }
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn announced_kinds(&self) -> Option<SmallVec<[MediaKind; 2]>> {
        self.announced.clone()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.synced = false;
        self.ready.clear();
        for es in self.elementary.values_mut() {
            es.pes.clear();
            es.continuity = None;
        }
    }

    fn finish(&mut self) {
        let mut open: Vec<(u16, Bytes, bool)> = self
            .elementary
            .iter_mut()
            .filter(|(_, es)| !es.pes.is_empty())
            .map(|(pid, es)| (*pid, es.pes.split().freeze(), es.random_access))
            .collect();
        open.sort_unstable_by_key(|(pid, _, _)| *pid);
        for (pid, pes, random_access) in open {
            self.on_pes(pid, &pes, random_access);
        }
    }
}
