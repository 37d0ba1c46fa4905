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

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::frame::{FrameReader, FrameWriter, LinkState};
use super::jsonb::{JsonbMessage, CONN_ID_KEY};
use super::socket::TcpSocket;
use crate::service::{NetworkConfig, ShutdownSignal};
use crate::{AppError, AppResult};

pub type ConnectionId = i64;

/// Id stamped on messages that did not come off a live socket, e.g. replayed ones.
pub const LOCAL_CONN_ID: ConnectionId = 0;

const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// One live peer: its socket halves, its two queues and its two workers.
///
/// The inbound worker owns the read half and appends tagged messages to
/// `incoming`. The outbound worker drains `outgoing` in FIFO order through the
/// shared writer. Both stop when the link drops or shutdown is raised.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    link: Arc<LinkState>,
    incoming: Arc<Mutex<Vec<JsonbMessage>>>,
    outgoing: Arc<Mutex<VecDeque<JsonbMessage>>>,
    outgoing_ready: Arc<Notify>,
    writer: Arc<AsyncMutex<FrameWriter<OwnedWriteHalf>>>,
    start_time: Instant,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn spawn(
        id: ConnectionId,
        socket: TcpSocket,
        runtime: &Handle,
        config: &NetworkConfig,
        shutdown: ShutdownSignal,
    ) -> Arc<Connection> {
        let (reader, writer) = socket.into_split(config.receive_wait());
        let link = reader.link().clone();
        let incoming = Arc::new(Mutex::new(Vec::new()));
        let outgoing = Arc::new(Mutex::new(VecDeque::new()));
        let outgoing_ready = Arc::new(Notify::new());
        let writer = Arc::new(AsyncMutex::new(writer));

        let inbound = runtime.spawn(inbound_loop(
            id,
            reader,
            incoming.clone(),
            shutdown.clone(),
            config.idle_sleep(),
        ));
        let outbound = runtime.spawn(outbound_loop(
            id,
            writer.clone(),
            outgoing.clone(),
            outgoing_ready.clone(),
            link.clone(),
            shutdown,
            config.idle_sleep(),
        ));

        Arc::new(Connection {
            id,
            link,
            incoming,
            outgoing,
            outgoing_ready,
            writer,
            start_time: Instant::now(),
            workers: Mutex::new(vec![inbound, outbound]),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Seconds since this connection was registered.
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn enqueue(&self, msg: JsonbMessage) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::Disconnected(format!(
                "connection {} is no longer connected",
                self.id
            )));
        }
        self.outgoing.lock().push_back(msg);
        self.outgoing_ready.notify_one();
        Ok(())
    }

    pub fn drain_incoming(&self) -> Vec<JsonbMessage> {
        std::mem::take(&mut *self.incoming.lock())
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.lock().len()
    }

    /// Sends the disconnect marker if the link is still up, closes the socket and
    /// joins both workers.
    pub(crate) async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            if writer.link().is_connected() {
                let marker = JsonbMessage::disconnect();
                match time::timeout(DISCONNECT_SEND_TIMEOUT, writer.send_jsonb_message(&marker))
                    .await
                {
                    Ok(Ok(())) => debug!(conn_id = self.id, "disconnect marker sent"),
                    Ok(Err(e)) => debug!(conn_id = self.id, "disconnect marker not sent: {}", e),
                    Err(_) => warn!(conn_id = self.id, "disconnect marker timed out"),
                }
            }
            writer.close().await;
        }
        self.outgoing_ready.notify_one();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(conn_id = self.id, "connection worker failed: {}", e);
            }
        }
        info!(conn_id = self.id, "connection closed");
    }
}

async fn inbound_loop<R: AsyncRead + Unpin>(
    id: ConnectionId,
    mut reader: FrameReader<R>,
    incoming: Arc<Mutex<Vec<JsonbMessage>>>,
    shutdown: ShutdownSignal,
    idle: Duration,
) {
    debug!(conn_id = id, "starting incoming msg worker");
    while !shutdown.is_set() && reader.link().is_connected() {
        match reader.receive_jsonb().await {
            Ok(None) => time::sleep(idle).await,
            Ok(Some(mut msg)) => {
                if msg.is_disconnect() {
                    info!(conn_id = id, "peer sent disconnect");
                    reader.link().disconnect();
                    break;
                }
                let Some(header) = msg.header.as_object_mut() else {
                    error!(
                        conn_id = id,
                        "jsonb header must be an object, closing connection"
                    );
                    reader.link().disconnect();
                    break;
                };
                header.insert(CONN_ID_KEY.to_string(), Value::from(id));
                incoming.lock().push(msg);
            }
            Err(e) => {
                if reader.link().is_connected() {
                    error!(conn_id = id, "receive failed, closing connection: {}", e);
                    reader.link().disconnect();
                } else {
                    debug!(conn_id = id, "receive stopped: {}", e);
                }
                break;
            }
        }
    }
    debug!(conn_id = id, "ending incoming msg worker");
}

async fn outbound_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    writer: Arc<AsyncMutex<FrameWriter<W>>>,
    outgoing: Arc<Mutex<VecDeque<JsonbMessage>>>,
    ready: Arc<Notify>,
    link: Arc<LinkState>,
    shutdown: ShutdownSignal,
    idle: Duration,
) {
    debug!(conn_id = id, "starting outgoing msg worker");
    while !shutdown.is_set() && link.is_connected() {
        let next = outgoing.lock().pop_front();
        let Some(msg) = next else {
            tokio::select! {
                _ = ready.notified() => {}
                _ = time::sleep(idle) => {}
            }
            continue;
        };
        let mut guard = writer.lock().await;
        if let Err(e) = guard.send_jsonb_message(&msg).await {
            error!(conn_id = id, "send failed, dropping message: {}", e);
            break;
        }
    }
    debug!(conn_id = id, "ending outgoing msg worker");
}
