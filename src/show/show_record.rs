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

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use super::flags::FlagsRecord;
use super::object::{composite_id, ObjectId, SceneObject};
use super::render::{InputEvent, RenderBackend, RenderSurface};
use super::window::ShowWindow;
use super::WindowId;
use crate::network::{ConnectionId, JsonbMessage, NetworkManager, CONN_ID_KEY, LOCAL_CONN_ID, TIME_KEY};
use crate::record::{copy_dir_recursive, load_session, MessageStore, SCENE_ASSETS_DIR};
use crate::service::ShowConfig;
use crate::AppError::{IllegalStateError, MalformedProtocol};
use crate::AppResult;

const IDLE_TICK_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Running,
    Finished,
}

/// The viewer: turns an ordered stream of JSONB messages, live or replayed
/// from disk, into windows and objects on a render backend.
///
/// Everything here runs on the caller's thread. The network manager is only
/// reached through its queue drains and sends.
pub struct ShowRecord {
    config: ShowConfig,
    backend: Box<dyn RenderBackend>,
    net: Option<NetworkManager>,
    client_target: Option<(String, u16)>,
    had_connection: bool,

    windows: BTreeMap<WindowId, ShowWindow>,
    closed_windows: BTreeSet<WindowId>,
    objects: HashMap<ObjectId, SceneObject>,
    flags: BTreeMap<ConnectionId, FlagsRecord>,
    control_panels: BTreeMap<ConnectionId, Box<dyn RenderSurface>>,

    messages: VecDeque<JsonbMessage>,
    wait_flag: bool,
    store: Option<MessageStore>,
    start_time: Instant,
    path_start_time: Instant,
    first_message_time: f64,
    input_path: Option<PathBuf>,
    video_frame: u64,
}

impl ShowRecord {
    pub fn new(config: ShowConfig, backend: Box<dyn RenderBackend>) -> AppResult<ShowRecord> {
        config.validate()?;
        let store = match &config.show.record_path {
            Some(path) => {
                info!("recording to {}", path.display());
                Some(MessageStore::create(path)?)
            }
            None => None,
        };
        let now = Instant::now();
        Ok(ShowRecord {
            config,
            backend,
            net: None,
            client_target: None,
            had_connection: false,
            windows: BTreeMap::new(),
            closed_windows: BTreeSet::new(),
            objects: HashMap::new(),
            flags: BTreeMap::new(),
            control_panels: BTreeMap::new(),
            messages: VecDeque::new(),
            wait_flag: false,
            store,
            start_time: now,
            path_start_time: now,
            first_message_time: 0.0,
            input_path: None,
            video_frame: 0,
        })
    }

    fn net_manager(&mut self) -> AppResult<&NetworkManager> {
        if self.net.is_none() {
            self.net = Some(NetworkManager::new(self.config.network.clone())?);
        }
        self.net
            .as_ref()
            .ok_or_else(|| IllegalStateError("network manager missing".into()))
    }

    /// Blocks until the server at `host:port` accepts.
    pub fn connect_client(&mut self, host: &str, port: u16) -> AppResult<()> {
        self.net_manager()?.connect_client(true, host, port)?;
        self.client_target = Some((host.to_string(), port));
        info!("connected to {}:{}", host, port);
        Ok(())
    }

    /// Starts accepting producers in the background.
    pub fn connect_server(&mut self, port: u16) -> AppResult<()> {
        self.net_manager()?.connect_server(false, port)?;
        info!("waiting for producers on port {}", port);
        Ok(())
    }

    /// Queues every message of a recorded or saved session for replay.
    pub fn setup_from_path(&mut self, path: &Path) -> AppResult<()> {
        let messages = load_session(path)?;
        info!("loaded {} messages from {}", messages.len(), path.display());
        self.input_path = Some(path.to_path_buf());
        for mut msg in messages {
            if let Some(header) = msg.header.as_object_mut() {
                header.insert(CONN_ID_KEY.to_string(), Value::from(LOCAL_CONN_ID));
            }
            self.messages.push_back(msg);
        }
        self.path_start_time = Instant::now();
        if let Some(time) = self.messages.front().and_then(JsonbMessage::time) {
            debug!("first message time: {}", time);
            self.first_message_time = time;
        }
        Ok(())
    }

    /// Queues one message as if it had arrived. Messages without a `conn_id`
    /// count as local.
    pub fn push_message(&mut self, msg: JsonbMessage) {
        self.messages.push_back(msg);
    }

    pub fn network(&self) -> Option<&NetworkManager> {
        self.net.as_ref()
    }

    pub fn window(&self, id: WindowId) -> Option<&ShowWindow> {
        self.windows.get(&id)
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.keys().copied().collect()
    }

    pub fn closed_window_ids(&self) -> Vec<WindowId> {
        self.closed_windows.iter().copied().collect()
    }

    pub fn object(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(&id)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn flags(&self, conn_id: ConnectionId) -> Option<&FlagsRecord> {
        self.flags.get(&conn_id)
    }

    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_flag
    }

    pub fn click_flag(&mut self, conn_id: ConnectionId, name: &str) -> bool {
        self.flags
            .get_mut(&conn_id)
            .map(|record| record.click(name))
            .unwrap_or(false)
    }

    fn send(&self, conn_id: ConnectionId, header: Value) {
        if conn_id == LOCAL_CONN_ID {
            return;
        }
        if let Some(net) = &self.net {
            if let Err(e) = net.send_jsonb_message(conn_id, header, Vec::new()) {
                debug!(conn_id, "message not sent: {}", e);
            }
        }
    }

    fn send_close(&self, conn_id: ConnectionId, base_window_id: i64) {
        self.send(conn_id, json!({"type": "close", "window": base_window_id}));
    }

    /// Applies every queued message that is due. Stops at the first message
    /// that is not due yet, and while a wait barrier is up.
    pub fn handle_incoming_messages(&mut self) -> AppResult<()> {
        while !self.wait_flag {
            let Some(front) = self.messages.front() else {
                break;
            };
            let conn_id = front.conn_id().unwrap_or(LOCAL_CONN_ID);
            let conn_time = if conn_id == LOCAL_CONN_ID {
                self.path_start_time.elapsed().as_secs_f64()
            } else {
                let time = self
                    .net
                    .as_ref()
                    .filter(|net| net.is_active_conn(conn_id))
                    .and_then(|net| net.get_conn_time(conn_id).ok());
                match time {
                    Some(time) => time,
                    None => {
                        trace!(conn_id, "dropping message of inactive connection");
                        self.messages.pop_front();
                        continue;
                    }
                }
            };
            if let Some(time) = front.time() {
                if time - self.first_message_time > conn_time * self.config.show.playback_speed {
                    break;
                }
            }

            let Some(msg) = self.messages.pop_front() else {
                break;
            };
            if self.apply_message(conn_id, &msg)? {
                self.record_message(&msg)?;
            }
        }
        Ok(())
    }

    /// Returns whether the message counts as applied and should be recorded.
    fn apply_message(&mut self, conn_id: ConnectionId, msg: &JsonbMessage) -> AppResult<bool> {
        match msg.message_type() {
            Some("metadata") => self.handle_metadata(conn_id, &msg.header)?,
            Some("file") => return self.handle_file(msg),
            Some("heartbeat") => {
                let base = msg.header.get("window_id").and_then(Value::as_i64).unwrap_or(0);
                if self.closed_windows.contains(&composite_id(base, conn_id)) {
                    self.send_close(conn_id, base);
                }
            }
            Some("scene") => return self.handle_scene(conn_id, msg),
            Some("wait") => {
                info!("wait flag set");
                self.wait_flag = true;
            }
            other => warn!(conn_id, "ignoring message of type {:?}", other),
        }
        Ok(true)
    }

    fn handle_metadata(&mut self, conn_id: ConnectionId, header: &Value) -> AppResult<()> {
        let flags = match header.get("flags").and_then(Value::as_array) {
            Some(flags) if !flags.is_empty() => flags,
            _ => return Ok(()),
        };
        if self.control_panels.contains_key(&conn_id) {
            return Ok(());
        }
        let record = FlagsRecord::from_metadata(flags)?;
        let title = match header.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => format!("{} Viz Control", name),
            _ => "Viz Control".to_string(),
        };
        info!(conn_id, "setting up control panel {}", title);
        let panel = self
            .backend
            .create_control_panel(conn_id, &title, &record.names())?;
        self.control_panels.insert(conn_id, panel);
        self.flags.insert(conn_id, record);
        Ok(())
    }

    fn handle_file(&mut self, msg: &JsonbMessage) -> AppResult<bool> {
        let name = msg
            .header
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedProtocol("file message without name".into()))?;
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            warn!("refusing file outside the asset dir: {}", name);
            return Ok(false);
        }
        let data = msg
            .payloads
            .first()
            .ok_or_else(|| MalformedProtocol(format!("file message {} without payload", name)))?;
        debug!("receiving file {} ({} bytes)", name, data.len());

        write_file(&self.config.show.asset_dir.join(relative), data)?;
        if let Some(store) = &self.store {
            write_file(&store.root().join(relative), data)?;
        }
        Ok(true)
    }

    fn handle_scene(&mut self, conn_id: ConnectionId, msg: &JsonbMessage) -> AppResult<bool> {
        let data = msg
            .header
            .get("data")
            .ok_or_else(|| MalformedProtocol("scene message without data".into()))?;
        let base_window_id = data.get("window_id").and_then(Value::as_i64).unwrap_or(0);
        let window_id = composite_id(base_window_id, conn_id);

        if self.closed_windows.contains(&window_id) {
            debug!(window_id, "scene for closed window");
            self.send_close(conn_id, base_window_id);
            return Ok(false);
        }

        let window_added = match self.windows.get_mut(&window_id) {
            Some(window) => {
                window.apply_update(data)?;
                false
            }
            None => {
                let window =
                    ShowWindow::setup(data, base_window_id, conn_id, self.backend.as_mut())?;
                self.windows.insert(window_id, window);
                true
            }
        };

        let entries: &[Value] = data
            .get("objects")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        // pass 1: create, update, destroy
        for entry in entries {
            let raw_id = entry
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| MalformedProtocol("scene object without id".into()))?;
            let id = composite_id(raw_id, conn_id);
            let destroy = entry.get("destroy").and_then(Value::as_bool).unwrap_or(false);

            if self.objects.contains_key(&id) {
                if let Some(object) = self.objects.get_mut(&id) {
                    if let Some(owner) = self.windows.get_mut(&object.window) {
                        owner.update_object(object, entry)?;
                        if destroy {
                            owner.destroy_object(object);
                        }
                    }
                }
                if destroy {
                    self.objects.remove(&id);
                }
                continue;
            }
            if destroy {
                continue;
            }

            let window = self
                .windows
                .get_mut(&window_id)
                .ok_or_else(|| IllegalStateError(format!("window {} vanished", window_id)))?;
            let object = window.add_object(id, entry, &msg.payloads)?;
            self.objects.insert(id, object);
        }

        // pass 2: parents may be declared after their children
        for entry in entries {
            let Some(parent) = entry.get("pose_parent").and_then(Value::as_str) else {
                continue;
            };
            if parent.is_empty() {
                continue;
            }
            let Some(raw_id) = entry.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let Some(object) = self.objects.get_mut(&composite_id(raw_id, conn_id)) else {
                continue;
            };
            if let Some(owner) = self.windows.get_mut(&object.window) {
                owner.set_parent(object, parent);
            }
        }

        if window_added {
            if let Some(window) = self.windows.get_mut(&window_id) {
                window.fit_camera_to_bounds();
                window.show();
            }
        }
        Ok(true)
    }

    fn record_message(&mut self, msg: &JsonbMessage) -> AppResult<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let mut header = msg.header.clone();
        if let Some(obj) = header.as_object_mut() {
            obj.insert(CONN_ID_KEY.to_string(), Value::from(LOCAL_CONN_ID));
            if !obj.contains_key(TIME_KEY) {
                let elapsed = self.start_time.elapsed().as_secs_f64();
                obj.insert(TIME_KEY.to_string(), Value::from(elapsed));
            }
        }
        store.append(&header, &msg.payloads)?;
        Ok(())
    }

    /// Sends each peer its flag states once per flags interval.
    pub fn handle_outgoing_messages(&mut self) {
        let interval = self.config.flags_interval();
        let mut due = Vec::new();
        for (conn_id, record) in self.flags.iter_mut() {
            if let Some(msg) = record.take_due_message(interval) {
                due.push((*conn_id, msg));
            }
        }
        for (conn_id, msg) in due {
            self.send(conn_id, msg);
        }
    }

    fn forward_input(&self, window: &ShowWindow, input: &InputEvent) {
        let base = window.base_id();
        let msg = match input {
            InputEvent::KeyPress { key } => json!({"type": "key_press", "window": base, "key": key}),
            InputEvent::Mouse {
                button,
                state,
                pos,
                window_size,
            } => json!({
                "type": "mouse_click",
                "window": base,
                "button": button,
                "state": state,
                "pos": pos,
                "window_size": window_size,
            }),
            InputEvent::KeyRelease { .. } | InputEvent::FlagClick { .. } => return,
        };
        self.send(window.conn_id(), msg);
    }

    fn update_windows(&mut self) -> AppResult<bool> {
        let mut save_flag = false;
        let ids: Vec<WindowId> = self.windows.keys().copied().collect();
        for id in ids {
            let capture = self.config.show.video_path.as_ref().map(|dir| {
                let path = dir.join(format!("frame_{}.png", self.video_frame));
                self.video_frame += 1;
                path
            });
            let Some(window) = self.windows.get_mut(&id) else {
                continue;
            };
            let update = window.update(capture.as_deref())?;
            save_flag |= window.save_flag;
            window.save_flag = false;

            let Some(window) = self.windows.get(&id) else {
                continue;
            };
            for input in &update.inputs {
                self.forward_input(window, input);
            }
            if update.hidden {
                self.send(window.conn_id(), json!({"type": "hide", "window": window.base_id()}));
            }
            if update.closed {
                self.send_close(window.conn_id(), window.base_id());
            }
        }
        Ok(save_flag)
    }

    fn update_control_panels(&mut self) {
        let mut inactive = Vec::new();
        for (conn_id, panel) in self.control_panels.iter_mut() {
            let active = self
                .net
                .as_ref()
                .map(|net| net.is_active_conn(*conn_id))
                .unwrap_or(false);
            if !active {
                panel.close();
                inactive.push(*conn_id);
                continue;
            }
            panel.render();
            for input in panel.poll_input() {
                if let InputEvent::FlagClick { name } = input {
                    if let Some(record) = self.flags.get_mut(conn_id) {
                        debug!(conn_id, "flag {} clicked", name);
                        record.click(&name);
                    }
                }
            }
        }
        for conn_id in inactive {
            debug!(conn_id, "dropping control panel of inactive connection");
            self.control_panels.remove(&conn_id);
            self.flags.remove(&conn_id);
        }
    }

    /// Drops every window, object and control panel and dials the server again.
    fn reconnect(&mut self) -> AppResult<()> {
        let Some((host, port)) = self.client_target.clone() else {
            return Ok(());
        };
        info!("all connections closed, resetting and reconnecting to {}:{}", host, port);
        for window in self.windows.values_mut() {
            window.close();
        }
        for panel in self.control_panels.values_mut() {
            panel.close();
        }
        self.windows.clear();
        self.closed_windows.clear();
        self.objects.clear();
        self.flags.clear();
        self.control_panels.clear();
        self.messages.clear();
        self.wait_flag = false;
        self.had_connection = false;
        self.net_manager()?.connect_client(false, &host, port)
    }

    /// One pass of the viewer loop.
    pub fn tick(&mut self) -> AppResult<TickStatus> {
        let mut reconnect = false;
        if let Some(net) = &self.net {
            net.clean_conns();
            if !net.connection_ids().is_empty() {
                self.had_connection = true;
            } else if self.client_target.is_some()
                && self.had_connection
                && !net.is_waiting_for_connection()
            {
                reconnect = true;
            }
            self.messages.extend(net.get_incoming_jsonb_messages_from_all());
        }
        if reconnect {
            self.reconnect()?;
        }

        self.handle_incoming_messages()?;
        self.handle_outgoing_messages();

        let save_flag = self.update_windows()?;
        self.update_control_panels();

        let windows_before = self.windows.len();
        self.retire_closed_windows();
        if !self.config.show.daemon && !self.closed_windows.is_empty() {
            info!("window closed, leaving viewer loop");
            return Ok(TickStatus::Finished);
        }

        if save_flag {
            let dir = self.save_scenes()?;
            info!("scenes saved to {}", dir.display());
        }

        if self.wait_flag && self.windows.len() < windows_before {
            // releasing the barrier closes every remaining window
            let ids: Vec<WindowId> = self.windows.keys().copied().collect();
            for id in ids {
                if let Some(window) = self.windows.get_mut(&id) {
                    window.close();
                }
                if let Some(window) = self.windows.get(&id) {
                    self.send_close(window.conn_id(), window.base_id());
                }
            }
            self.retire_closed_windows();
            info!("wait flag cleared");
            self.wait_flag = false;
        }

        let replay_done = self.net.is_none()
            && self.messages.is_empty()
            && (self.windows.is_empty() || self.config.show.exit_when_replayed);
        if !self.config.show.daemon && replay_done {
            info!("replay finished");
            return Ok(TickStatus::Finished);
        }
        Ok(TickStatus::Running)
    }

    /// Moves shut down windows into the closed set and drops their objects.
    fn retire_closed_windows(&mut self) {
        let closed: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|(_, window)| window.is_shutdown())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.windows.remove(&id);
            self.objects.retain(|_, object| object.window != id);
            self.closed_windows.insert(id);
        }
    }

    fn frame_sleep(&self) -> Duration {
        let fps = self
            .windows
            .values()
            .map(|window| window.settings().fps)
            .filter(|fps| *fps > 0.0)
            .fold(0.0, f64::max);
        if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            IDLE_TICK_SLEEP
        }
    }

    pub fn spin(&mut self) -> AppResult<()> {
        info!("viewer loop started, daemon: {}", self.config.show.daemon);
        loop {
            match self.tick() {
                Ok(TickStatus::Running) => std::thread::sleep(self.frame_sleep()),
                Ok(TickStatus::Finished) => break,
                Err(e) => {
                    error!("viewer loop failed: {}", e);
                    return Err(e);
                }
            }
        }
        for window in self.windows.values_mut() {
            window.close();
        }
        info!("viewer loop exited");
        Ok(())
    }

    /// Writes every live window as a replayable session into a fresh
    /// directory under the save dir.
    pub fn save_scenes(&mut self) -> AppResult<PathBuf> {
        let save_dir = &self.config.show.save_dir;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut dir = save_dir.join(format!("scene_{}", stamp));
        let mut suffix = 1;
        while dir.exists() {
            dir = save_dir.join(format!("scene_{}_{}", stamp, suffix));
            suffix += 1;
        }
        let mut store = MessageStore::create(&dir)?;

        for window in self.windows.values() {
            let mut objects: Vec<&SceneObject> = self
                .objects
                .values()
                .filter(|object| object.window == window.id())
                .collect();
            objects.sort_by_key(|object| object.id);
            let (scene, bufs) = window.produce_scene(objects);
            store.append(&json!({"type": "scene", "data": scene}), &bufs)?;
        }

        let assets = [
            self.input_path.as_deref(),
            self.store.as_ref().map(MessageStore::root),
            Some(self.config.show.asset_dir.as_path()),
        ]
        .into_iter()
        .flatten()
        .map(|root| root.join(SCENE_ASSETS_DIR))
        .find(|path| path.is_dir());
        if let Some(assets) = assets {
            copy_dir_recursive(&assets, &dir.join(SCENE_ASSETS_DIR))?;
        }
        Ok(dir)
    }
}

fn write_file(path: &Path, data: &Bytes) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}
