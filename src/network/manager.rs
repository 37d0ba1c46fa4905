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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::{self, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionId};
use super::jsonb::JsonbMessage;
use super::socket::{ListenSocket, TcpSocket};
use crate::service::{NetworkConfig, ShutdownSignal};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMode {
    Idle,
    Client,
    Server,
    ShuttingDown,
}

/// Registry of live connections, shared with the background accept/connect task.
#[derive(Debug)]
struct ConnTable {
    conns: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicI64,
    handle: Handle,
    config: NetworkConfig,
    shutdown: ShutdownSignal,
}

impl ConnTable {
    fn add_conn(&self, socket: TcpSocket) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let peer = socket.peer_addr();
        let conn = Connection::spawn(id, socket, &self.handle, &self.config, self.shutdown.clone());
        self.conns.write().insert(id, conn);
        info!(conn_id = id, "registered connection from {:?}", peer);
        id
    }

    fn get(&self, conn_id: ConnectionId) -> AppResult<Arc<Connection>> {
        self.conns
            .read()
            .get(&conn_id)
            .cloned()
            .ok_or(AppError::UnknownConnection(conn_id))
    }
}

/// Owns every connection of one process, in client or server mode.
///
/// The public API is synchronous; the workers run on a private tokio runtime.
/// Dropping the manager stops all background work and joins every worker
/// before returning.
#[derive(Debug)]
pub struct NetworkManager {
    table: Arc<ConnTable>,
    mode: Mutex<ManagerMode>,
    listener: Mutex<Option<Arc<ListenSocket>>>,
    waiting_for_connection: Arc<AtomicBool>,
    background: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    runtime: Runtime,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> AppResult<NetworkManager> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("vephor-net")
            .enable_all()
            .build()?;
        let shutdown = ShutdownSignal::new();
        let table = Arc::new(ConnTable {
            conns: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            handle: runtime.handle().clone(),
            config,
            shutdown: shutdown.clone(),
        });
        Ok(NetworkManager {
            table,
            mode: Mutex::new(ManagerMode::Idle),
            listener: Mutex::new(None),
            waiting_for_connection: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(None),
            shutdown,
            runtime,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.table.config
    }

    pub fn mode(&self) -> ManagerMode {
        *self.mode.lock()
    }

    fn enter_mode(&self, wanted: ManagerMode) -> AppResult<()> {
        let mut mode = self.mode.lock();
        match (*mode, wanted) {
            (ManagerMode::ShuttingDown, _) => Err(AppError::IllegalStateError(
                "network manager is shutting down".into(),
            )),
            (ManagerMode::Idle, _) => {
                *mode = wanted;
                Ok(())
            }
            (ManagerMode::Server, ManagerMode::Client) | (ManagerMode::Client, ManagerMode::Server) => {
                Err(AppError::ModeConflict(
                    "can't use server and client mode at the same time".into(),
                ))
            }
            (ManagerMode::Server, _) => Err(AppError::ModeConflict("server mode already active".into())),
            (ManagerMode::Client, _) => {
                if self.waiting_for_connection.load(Ordering::Acquire)
                    || !self.table.conns.read().is_empty()
                {
                    return Err(AppError::ModeConflict("client mode already active".into()));
                }
                // reconnect after every connection went away
                Ok(())
            }
        }
    }

    /// Joins a finished background task before a new one replaces it.
    fn reap_background(&self) {
        let finished = self.background.lock().take();
        if let Some(task) = finished {
            if let Err(e) = self.runtime.block_on(task) {
                error!("background network task failed: {}", e);
            }
        }
    }

    /// Connects to a listening peer, either waiting for it or in the background.
    ///
    /// Calling again is allowed once every earlier connection is gone and no
    /// background connect is pending.
    pub fn connect_client(&self, blocking: bool, host: &str, port: u16) -> AppResult<()> {
        self.enter_mode(ManagerMode::Client)?;
        self.reap_background();
        let retry = self.table.config.connect_retry();
        if blocking {
            info!("connecting to {}:{}", host, port);
            let socket = self.runtime.block_on(TcpSocket::connect(host, port, retry))?;
            self.table.add_conn(socket);
            return Ok(());
        }

        info!("connecting to {}:{} in background", host, port);
        self.waiting_for_connection.store(true, Ordering::Release);
        let table = self.table.clone();
        let waiting = self.waiting_for_connection.clone();
        let mut shutdown = self.shutdown.subscribe();
        let host = host.to_string();
        let task = self.runtime.spawn(async move {
            tokio::select! {
                result = TcpSocket::connect(&host, port, retry) => match result {
                    Ok(socket) => {
                        table.add_conn(socket);
                    }
                    Err(e) => error!("background connect to {}:{} failed: {}", host, port, e),
                },
                _ = shutdown.recv() => debug!("background connect abandoned on shutdown"),
            }
            waiting.store(false, Ordering::Release);
        });
        *self.background.lock() = Some(task);
        Ok(())
    }

    fn bind_and_listen(&self, port: u16) -> AppResult<Arc<ListenSocket>> {
        let mut listener = self.listener.lock();
        if let Some(existing) = listener.as_ref() {
            return Ok(existing.clone());
        }
        let bound = Arc::new(self.runtime.block_on(ListenSocket::bind_and_listen(port))?);
        *listener = Some(bound.clone());
        Ok(bound)
    }

    /// Port actually bound in server mode. Useful after binding port 0.
    pub fn listen_port(&self) -> Option<u16> {
        self.listener.lock().as_ref().and_then(|l| l.local_port())
    }

    /// Listens on `port`. Blocking mode returns after the first peer is
    /// registered; background mode keeps accepting until shutdown.
    pub fn connect_server(&self, blocking: bool, port: u16) -> AppResult<()> {
        self.enter_mode(ManagerMode::Server)?;
        let listener = self.bind_and_listen(port)?;
        let accept_wait = self.table.config.accept_wait();
        let accept_retry = self.table.config.accept_retry();

        if blocking {
            info!("waiting for a connection on port {}", port);
            let socket = self.runtime.block_on(async {
                loop {
                    if self.shutdown.is_set() {
                        return Err(AppError::IllegalStateError(
                            "shutdown while waiting for connection".into(),
                        ));
                    }
                    if let Some(socket) = listener.accept(accept_wait).await? {
                        return Ok(socket);
                    }
                }
            })?;
            self.table.add_conn(socket);
            return Ok(());
        }

        info!("accepting connections on port {} in background", port);
        self.waiting_for_connection.store(true, Ordering::Release);
        let table = self.table.clone();
        let waiting = self.waiting_for_connection.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = self.runtime.spawn(async move {
            while !shutdown.is_shutdown() {
                tokio::select! {
                    accepted = listener.accept(accept_wait) => match accepted {
                        Ok(Some(socket)) => {
                            table.add_conn(socket);
                            continue;
                        }
                        Ok(None) => trace!("no connection yet"),
                        Err(e) => warn!("{}", e),
                    },
                    _ = shutdown.recv() => break,
                }
                tokio::select! {
                    _ = time::sleep(accept_retry) => {}
                    _ = shutdown.recv() => {}
                }
            }
            waiting.store(false, Ordering::Release);
            debug!("accept loop stopped");
        });
        *self.background.lock() = Some(task);
        Ok(())
    }

    pub fn is_waiting_for_connection(&self) -> bool {
        self.waiting_for_connection.load(Ordering::Acquire)
    }

    /// Removes every connection whose link dropped and joins its workers.
    pub fn clean_conns(&self) {
        let dead: Vec<Arc<Connection>> = {
            let mut conns = self.table.conns.write();
            let dead_ids: Vec<ConnectionId> = conns
                .iter()
                .filter(|(_, conn)| !conn.is_connected())
                .map(|(id, _)| *id)
                .collect();
            dead_ids
                .into_iter()
                .filter_map(|id| conns.remove(&id))
                .collect()
        };
        for conn in dead {
            info!(conn_id = conn.id(), "removing disconnected connection");
            self.runtime.block_on(conn.close());
        }
    }

    pub fn send_jsonb_message(
        &self,
        conn_id: ConnectionId,
        header: Value,
        payloads: Vec<Bytes>,
    ) -> AppResult<()> {
        self.table
            .get(conn_id)?
            .enqueue(JsonbMessage::new(header, payloads))
    }

    /// Queues a copy on every live connection. Returns whether any accepted it.
    pub fn send_jsonb_message_to_all(&self, header: &Value, payloads: &[Bytes]) -> bool {
        let conns: Vec<Arc<Connection>> = self.table.conns.read().values().cloned().collect();
        let mut sent = false;
        for conn in conns {
            match conn.enqueue(JsonbMessage::new(header.clone(), payloads.to_vec())) {
                Ok(()) => sent = true,
                Err(e) => debug!(conn_id = conn.id(), "skipping send: {}", e),
            }
        }
        sent
    }

    pub fn get_incoming_jsonb_messages(&self, conn_id: ConnectionId) -> AppResult<Vec<JsonbMessage>> {
        Ok(self.table.get(conn_id)?.drain_incoming())
    }

    /// Drains every connection, concatenated in ascending id order.
    pub fn get_incoming_jsonb_messages_from_all(&self) -> Vec<JsonbMessage> {
        let conns = self.table.conns.read();
        conns.values().flat_map(|conn| conn.drain_incoming()).collect()
    }

    pub fn get_conn_time(&self, conn_id: ConnectionId) -> AppResult<f64> {
        Ok(self.table.get(conn_id)?.elapsed_secs())
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.table.conns.read().keys().copied().collect()
    }

    pub fn is_active_conn(&self, conn_id: ConnectionId) -> bool {
        self.table.conns.read().contains_key(&conn_id)
    }

    pub fn outgoing_queue_size(&self, conn_id: ConnectionId) -> AppResult<usize> {
        Ok(self.table.get(conn_id)?.outgoing_len())
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        debug!("network manager shutting down");
        *self.mode.lock() = ManagerMode::ShuttingDown;
        self.shutdown.trigger();
        self.reap_background();

        let conns: Vec<Arc<Connection>> = std::mem::take(&mut *self.table.conns.write())
            .into_values()
            .collect();
        for conn in conns {
            self.runtime.block_on(conn.close());
        }
        info!("network manager shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn server() -> AppResult<(NetworkManager, u16)> {
        let manager = NetworkManager::new(NetworkConfig::default())?;
        manager.connect_server(false, 0)?;
        let port = manager.listen_port().expect("bound");
        Ok((manager, port))
    }

    #[test]
    fn test_mode_conflict() -> AppResult<()> {
        let (manager, port) = server()?;
        let result = manager.connect_client(false, "127.0.0.1", port);
        assert!(matches!(result, Err(AppError::ModeConflict(_))));
        assert!(matches!(
            manager.connect_server(false, port),
            Err(AppError::ModeConflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_loopback_exchange() -> AppResult<()> {
        let (server, port) = server()?;
        let client = NetworkManager::new(NetworkConfig::default())?;
        client.connect_client(true, "127.0.0.1", port)?;
        assert_eq!(client.connection_ids(), vec![1]);

        assert!(wait_until(|| server.connection_ids().len() == 1));
        let server_conn = server.connection_ids()[0];

        client.send_jsonb_message(1, json!({"type": "x", "k": 1}), vec![])?;
        let mut received = Vec::new();
        assert!(wait_until(|| {
            received.extend(server.get_incoming_jsonb_messages(server_conn).unwrap());
            !received.is_empty()
        }));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].header, json!({"type": "x", "k": 1, "conn_id": server_conn}));
        assert!(received[0].payloads.is_empty());

        // drained: a second read returns nothing
        assert!(server.get_incoming_jsonb_messages(server_conn)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_peer_drop_is_swept() -> AppResult<()> {
        let (server, port) = server()?;
        {
            let client = NetworkManager::new(NetworkConfig::default())?;
            client.connect_client(true, "127.0.0.1", port)?;
            assert!(wait_until(|| server.connection_ids().len() == 1));
        }
        let conn_id = server.connection_ids()[0];
        assert!(wait_until(|| {
            server.clean_conns();
            !server.is_active_conn(conn_id)
        }));
        // the disconnect marker is consumed, never delivered
        assert!(server.get_incoming_jsonb_messages_from_all().is_empty());
        assert!(matches!(
            server.get_conn_time(conn_id),
            Err(AppError::UnknownConnection(_))
        ));
        Ok(())
    }

    #[test]
    fn test_array_header_closes_connection() -> AppResult<()> {
        let (server, port) = server()?;
        let client = NetworkManager::new(NetworkConfig::default())?;
        client.connect_client(true, "127.0.0.1", port)?;
        assert!(wait_until(|| server.connection_ids().len() == 1));
        let conn_id = server.connection_ids()[0];

        client.send_jsonb_message(1, json!([1, 2, 3]), vec![])?;
        assert!(wait_until(|| {
            server.clean_conns();
            !server.is_active_conn(conn_id)
        }));
        assert!(server.get_incoming_jsonb_messages_from_all().is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_connection() -> AppResult<()> {
        let manager = NetworkManager::new(NetworkConfig::default())?;
        assert!(matches!(
            manager.send_jsonb_message(7, json!({}), vec![]),
            Err(AppError::UnknownConnection(7))
        ));
        assert!(!manager.send_jsonb_message_to_all(&json!({}), &[]));
        Ok(())
    }
}
