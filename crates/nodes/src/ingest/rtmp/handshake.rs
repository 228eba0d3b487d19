// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Simple (unsigned) RTMP handshake, client side.
//!
//! ```text
//! client                      server
//!   C0 (version 3) + C1  ---->
//!                      <----  S0 + S1 + S2
//!   C2 (echo of S1)      ---->
//! ```

use mediacore_core::{MediaCoreError, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

/// C1: 4-byte epoch, 4 zero bytes, then filler.
fn c1(epoch_ms: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HANDSHAKE_SIZE);
    packet.extend_from_slice(&epoch_ms.to_be_bytes());
    packet.extend_from_slice(&[0; 4]);
    let mut state = epoch_ms | 1;
    while packet.len() < HANDSHAKE_SIZE {
        // xorshift32
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        packet.push(state.to_be_bytes()[0]);
    }
    packet
}

/// Runs the handshake on a freshly connected socket.
///
/// # Errors
///
/// `Network` on socket failure or if the server answers with another protocol version.
pub async fn client_handshake<S>(socket: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_millis() % u128::from(u32::MAX)).unwrap_or(0))
        .unwrap_or(0);
    let mut hello = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    hello.push(RTMP_VERSION);
    hello.extend_from_slice(&c1(epoch_ms));
    socket.write_all(&hello).await.map_err(io_error)?;
    socket.flush().await.map_err(io_error)?;

    let mut reply = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
    socket.read_exact(&mut reply).await.map_err(io_error)?;
    if reply[0] != RTMP_VERSION {
        return Err(MediaCoreError::Network(format!(
            "RTMP server answered with version {}",
            reply[0]
        )));
    }

    let s1 = &reply[1..=HANDSHAKE_SIZE];
    socket.write_all(s1).await.map_err(io_error)?;
    socket.flush().await.map_err(io_error)?;
    tracing::debug!(server_epoch = u32::from_be_bytes([s1[0], s1[1], s1[2], s1[3]]), "RTMP handshake done");
    Ok(())
}

fn io_error(e: std::io::Error) -> MediaCoreError {
    MediaCoreError::Network(format!("RTMP handshake: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_version_and_c1_then_echoes_s1() {
        let (mut client, mut server) = tokio::io::duplex(8 * 1024);
        let peer = tokio::spawn(async move {
            let mut hello = vec![0u8; 1 + HANDSHAKE_SIZE];
            server.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello[0], RTMP_VERSION);
            assert_eq!(&hello[5..9], &[0, 0, 0, 0]);

            let s1: Vec<u8> = (0..HANDSHAKE_SIZE).map(|i| (i % 251) as u8).collect();
            server.write_all(&[RTMP_VERSION]).await.unwrap();
            server.write_all(&s1).await.unwrap();
            server.write_all(&hello[1..]).await.unwrap();

            let mut c2 = vec![0u8; HANDSHAKE_SIZE];
            server.read_exact(&mut c2).await.unwrap();
            assert_eq!(c2, s1);
        });

        client_handshake(&mut client).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let (mut client, mut server) = tokio::io::duplex(8 * 1024);
        tokio::spawn(async move {
            let mut hello = vec![0u8; 1 + HANDSHAKE_SIZE];
            server.read_exact(&mut hello).await.unwrap();
            server.write_all(&[6]).await.unwrap();
            server.write_all(&vec![0u8; 2 * HANDSHAKE_SIZE]).await.unwrap();
        });
        let err = client_handshake(&mut client).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
