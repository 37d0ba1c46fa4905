// Copyright 2025 The vephor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::trace;

use crate::{AppError, AppResult};

/// Largest slice handed to one write call.
pub const SEND_CHUNK_SIZE: usize = 1024;
/// Width of every length and count field on the wire.
pub const LENGTH_FIELD_SIZE: usize = std::mem::size_of::<u64>();
/// Frames claiming more than this are treated as corrupt.
pub const MAX_FRAME_SIZE: u64 = 1 << 32;

/// Largest buffer one `receive` call allocates.
pub const RECEIVE_CHUNK_SIZE: usize = 64 * 1024;

const RECEIVE_EXACT_POLL: Duration = Duration::from_millis(1);

/// Connected flag shared by the two halves of one socket.
#[derive(Debug)]
pub struct LinkState {
    connected: AtomicBool,
}

impl LinkState {
    pub fn new_connected() -> Arc<LinkState> {
        Arc::new(LinkState {
            connected: AtomicBool::new(true),
        })
    }
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Read side of a framed socket.
///
/// Every primitive returns early with an empty buffer when nothing arrived within
/// the configured wait, so callers can poll the shutdown flag between calls.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    link: Arc<LinkState>,
    wait: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, link: Arc<LinkState>, wait: Duration) -> FrameReader<R> {
        FrameReader { inner, link, wait }
    }

    pub fn link(&self) -> &Arc<LinkState> {
        &self.link
    }

    /// Returns whatever is available, up to `max_bytes` capped at
    /// [`RECEIVE_CHUNK_SIZE`], after at most one wait window. An empty buffer
    /// means no data yet.
    pub async fn receive(&mut self, max_bytes: usize) -> AppResult<BytesMut> {
        if !self.link.is_connected() {
            return Err(AppError::Disconnected(
                "can't receive from unconnected socket".into(),
            ));
        }
        let mut buf = BytesMut::zeroed(max_bytes.min(RECEIVE_CHUNK_SIZE));
        if max_bytes == 0 {
            return Ok(buf);
        }
        match time::timeout(self.wait, self.inner.read(&mut buf)).await {
            Err(_) => {
                buf.clear();
                Ok(buf)
            }
            Ok(Ok(0)) => {
                self.link.disconnect();
                Err(AppError::Disconnected("connection closed by peer".into()))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                buf.clear();
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.link.disconnect();
                Err(AppError::DetailedIoError(format!("error reading from socket: {}", e)))
            }
        }
    }

    /// Accumulates exactly `size` bytes.
    ///
    /// With `fail_on_empty_first_read` an empty first poll returns an empty buffer
    /// right away: nothing is pending. Once any byte of the frame has arrived the
    /// call keeps polling until the rest shows up, with no overall timeout.
    pub async fn receive_exact(
        &mut self,
        size: usize,
        fail_on_empty_first_read: bool,
    ) -> AppResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(size.min(RECEIVE_CHUNK_SIZE));
        let mut first = true;
        while buf.len() < size {
            let chunk = self.receive(size - buf.len()).await?;
            if first && fail_on_empty_first_read && chunk.is_empty() {
                return Ok(buf);
            }
            first = false;
            buf.extend_from_slice(&chunk);
            if buf.len() < size {
                time::sleep(RECEIVE_EXACT_POLL).await;
            }
        }
        Ok(buf)
    }

    pub async fn receive_u64(&mut self, fail_on_empty_first_read: bool) -> AppResult<Option<u64>> {
        let buf = self
            .receive_exact(LENGTH_FIELD_SIZE, fail_on_empty_first_read)
            .await?;
        if buf.is_empty() {
            return Ok(None);
        }
        let mut field = [0u8; LENGTH_FIELD_SIZE];
        field.copy_from_slice(&buf);
        Ok(Some(u64::from_le_bytes(field)))
    }

    /// Reads one length-prefixed message.
    pub async fn receive_message(&mut self) -> AppResult<BytesMut> {
        let size = self
            .receive_u64(false)
            .await?
            .ok_or_else(|| AppError::Disconnected("message length missing".into()))?;
        if size > MAX_FRAME_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame of length {} is too large",
                size
            )));
        }
        trace!("receiving message of {} bytes", size);
        self.receive_exact(size as usize, false).await
    }
}

/// Write side of a framed socket.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    link: Arc<LinkState>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, link: Arc<LinkState>) -> FrameWriter<W> {
        FrameWriter { inner, link }
    }

    pub fn link(&self) -> &Arc<LinkState> {
        &self.link
    }

    /// Writes all of `buf` in chunks of at most [`SEND_CHUNK_SIZE`]. Any failure
    /// disconnects the link.
    pub async fn send(&mut self, buf: &[u8]) -> AppResult<()> {
        if !self.link.is_connected() {
            return Err(AppError::Disconnected(
                "can't send from unconnected socket".into(),
            ));
        }
        for chunk in buf.chunks(SEND_CHUNK_SIZE) {
            if let Err(e) = self.inner.write_all(chunk).await {
                self.link.disconnect();
                return Err(AppError::DetailedIoError(format!(
                    "error writing to socket: {}",
                    e
                )));
            }
        }
        Ok(())
    }

    pub async fn send_u64(&mut self, value: u64) -> AppResult<()> {
        self.send(&value.to_le_bytes()).await
    }

    /// Writes one length-prefixed message.
    pub async fn send_message(&mut self, buf: &[u8]) -> AppResult<()> {
        self.send_u64(buf.len() as u64).await?;
        self.send(buf).await
    }

    pub async fn flush(&mut self) -> AppResult<()> {
        if let Err(e) = self.inner.flush().await {
            self.link.disconnect();
            return Err(AppError::DetailedIoError(format!("flush error: {}", e)));
        }
        Ok(())
    }

    /// Marks the link closed and shuts down the write direction.
    pub async fn close(&mut self) {
        self.link.disconnect();
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncWriteExt};

    const WAIT: Duration = Duration::from_millis(100);

    fn pipe() -> (FrameReader<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        (FrameReader::new(near, LinkState::new_connected(), WAIT), far)
    }

    #[tokio::test]
    async fn test_receive_exact_returns_empty_when_nothing_pending() -> AppResult<()> {
        let (mut reader, _far) = pipe();
        let start = Instant::now();
        let buf = reader.receive_exact(8, true).await?;
        assert!(buf.is_empty());
        // one wait window, not an endless poll
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_receive_exact_waits_for_delayed_bytes() -> AppResult<()> {
        let (mut reader, mut far) = pipe();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            far.write_all(&[1, 2, 3]).await.unwrap();
            time::sleep(Duration::from_millis(250)).await;
            far.write_all(&[4, 5, 6, 7, 8]).await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
        });
        let buf = reader.receive_exact(8, true).await?;
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_large_frame_read_in_bounded_chunks() -> AppResult<()> {
        let (mut reader, mut far) = pipe();
        let size = RECEIVE_CHUNK_SIZE * 3 + 17;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let sent = data.clone();
        tokio::spawn(async move {
            far.write_all(&sent).await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
        });

        let first = reader.receive(usize::MAX).await?;
        assert!(!first.is_empty());
        assert!(first.len() <= RECEIVE_CHUNK_SIZE);
        let rest = reader.receive_exact(size - first.len(), false).await?;
        assert_eq!([&first[..], &rest[..]].concat(), data);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (mut reader, far) = pipe();
        drop(far);
        let result = reader.receive(16).await;
        assert!(matches!(result, Err(AppError::Disconnected(_))));
        assert!(!reader.link().is_connected());
    }

    #[tokio::test]
    async fn test_message_round_trip_over_chunks() -> AppResult<()> {
        let (near, far) = duplex(64 * 1024);
        let link = LinkState::new_connected();
        let mut writer = FrameWriter::new(near, link.clone());
        let mut reader = FrameReader::new(far, LinkState::new_connected(), WAIT);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let send = tokio::spawn(async move {
            writer.send_message(&payload).await.unwrap();
            writer.flush().await.unwrap();
            writer
        });
        let received = reader.receive_message().await?;
        assert_eq!(&received[..], &expected[..]);
        send.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_send_on_closed_link_fails() {
        let (near, _far) = duplex(1024);
        let mut writer = FrameWriter::new(near, LinkState::new_connected());
        writer.close().await;
        assert!(matches!(
            writer.send(b"late").await,
            Err(AppError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut reader, mut far) = pipe();
        far.write_all(&(MAX_FRAME_SIZE + 1).to_le_bytes()).await.unwrap();
        let result = reader.receive_message().await;
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }
}
