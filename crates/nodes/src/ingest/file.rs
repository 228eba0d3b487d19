// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `file://` sources.

use super::demux::{ByteStream, DemuxSource};
use super::{MediaSource, OpenContext, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mediacore_core::{MediaCoreError, Result, SourceUri};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Transport for `file://`. The container is chosen by extension, falling back to sniffing.
pub struct FileTransport;

#[async_trait]
impl Transport for FileTransport {
    async fn open(&self, uri: &SourceUri, ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        let path = uri.as_url().to_file_path().map_err(|()| {
            MediaCoreError::InvalidArgument(format!("not a local file path: {uri}"))
        })?;
        let stream = FileByteStream::open(path, ctx.config.read_chunk_size).await?;
        let container = uri.extension().filter(|ext| ctx.demuxers.supports(ext));
        let source = DemuxSource::open(Box::new(stream), &ctx.demuxers, container.as_deref()).await?;
        Ok(Box::new(source))
    }
}

/// Chunked reader over a local file.
pub struct FileByteStream {
    path: PathBuf,
    file: File,
    chunk_size: usize,
}

impl FileByteStream {
    /// # Errors
    ///
    /// `Io` if the file cannot be opened.
    pub async fn open(path: PathBuf, chunk_size: usize) -> Result<Self> {
        let file = File::open(&path).await?;
        tracing::debug!(path = %path.display(), "Opened file source");
        Ok(Self { path, file, chunk_size: chunk_size.max(1) })
    }
}

#[async_trait]
impl ByteStream for FileByteStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    fn can_rewind(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).await.map_err(|e| {
            MediaCoreError::Io(std::io::Error::new(
                e.kind(),
                format!("rewinding {}: {e}", self.path.display()),
            ))
        })?;
        Ok(())
    }
}
