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

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, trace};

use super::frame::{FrameReader, FrameWriter, LinkState};
use crate::{AppError, AppResult};

/// A connected TCP stream, not yet split into its framed halves.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    pub fn from_stream(stream: TcpStream) -> TcpSocket {
        let peer = stream.peer_addr().ok();
        // visual updates are small and latency sensitive
        let _ = stream.set_nodelay(true);
        TcpSocket { stream, peer }
    }

    /// Resolves `host` and keeps dialing every `retry` until a peer accepts.
    ///
    /// A host that does not resolve is an error right away. Only the dial itself
    /// is retried.
    #[cfg(not(windows))]
    pub async fn connect(host: &str, port: u16, retry: Duration) -> AppResult<TcpSocket> {
        let addrs = resolve(host, port).await?;
        let mut attempts: u64 = 0;
        loop {
            for addr in &addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        info!("connected to {} after {} retries", addr, attempts);
                        return Ok(TcpSocket::from_stream(stream));
                    }
                    Err(e) => trace!("connect to {} failed: {}", addr, e),
                }
            }
            attempts += 1;
            time::sleep(retry).await;
        }
    }

    /// Windows hosts only get a single attempt per call.
    #[cfg(windows)]
    pub async fn connect(host: &str, port: u16, _retry: Duration) -> AppResult<TcpSocket> {
        let addrs = resolve(host, port).await?;
        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(TcpSocket::from_stream(stream)),
                Err(e) => last_error = Some(e),
            }
        }
        Err(AppError::DetailedIoError(format!(
            "unable to connect to {}:{}: {:?}",
            host, port, last_error
        )))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn into_split(
        self,
        receive_wait: Duration,
    ) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let link = LinkState::new_connected();
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader::new(read_half, link.clone(), receive_wait),
            FrameWriter::new(write_half, link),
        )
    }
}

async fn resolve(host: &str, port: u16) -> AppResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| AppError::DetailedIoError(format!("no such host {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(AppError::DetailedIoError(format!("no such host {}", host)));
    }
    Ok(addrs)
}

/// Listening socket, bound once and then polled with bounded accepts.
#[derive(Debug)]
pub struct ListenSocket {
    listener: TcpListener,
}

impl ListenSocket {
    pub async fn bind_and_listen(port: u16) -> AppResult<ListenSocket> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| AppError::Accept(format!("bind to port {} failed: {}", port, e)))?;
        debug!("listening on {:?}", listener.local_addr().ok());
        Ok(ListenSocket { listener })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|addr| addr.port())
    }

    /// Waits at most `wait` for one inbound connection.
    pub async fn accept(&self, wait: Duration) -> AppResult<Option<TcpSocket>> {
        match time::timeout(wait, self.listener.accept()).await {
            Err(_) => Ok(None),
            Ok(Ok((stream, addr))) => {
                info!("accepted connection from {}", addr);
                Ok(Some(TcpSocket::from_stream(stream)))
            }
            Ok(Err(e)) => Err(AppError::Accept(format!("accept failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_times_out_without_peer() -> AppResult<()> {
        let listener = ListenSocket::bind_and_listen(0).await?;
        assert!(listener.local_port().is_some());
        let accepted = listener.accept(Duration::from_millis(50)).await?;
        assert!(accepted.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_and_accept() -> AppResult<()> {
        let listener = ListenSocket::bind_and_listen(0).await?;
        let port = listener.local_port().unwrap();
        let client = tokio::spawn(async move {
            TcpSocket::connect("127.0.0.1", port, Duration::from_millis(20)).await
        });
        let mut accepted = None;
        for _ in 0..20 {
            accepted = listener.accept(Duration::from_millis(100)).await?;
            if accepted.is_some() {
                break;
            }
        }
        assert!(accepted.is_some());
        assert!(client.await.unwrap()?.peer_addr().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails() {
        let result =
            TcpSocket::connect("no-such-host.invalid", 1, Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
