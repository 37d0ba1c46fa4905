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

use std::path::Path;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::object::{composite_id, ObjectDesc, ObjectId, SceneObject};
use super::pose::{Bounds, Pose};
use super::render::{
    CameraControl, InputEvent, RenderBackend, RenderSurface, SurfaceStatus, WindowSettings,
};
use super::scene_graph::{Anchor, NodeId, SceneGraph};
use super::WindowId;
use crate::network::ConnectionId;
use crate::AppError::MalformedProtocol;
use crate::AppResult;

/// Key code that asks the viewer to save every window.
pub const SAVE_KEY: i32 = 86;

/// What happened to a window during one frame.
#[derive(Debug, Default, PartialEq)]
pub struct WindowUpdate {
    pub closed: bool,
    pub hidden: bool,
    pub inputs: Vec<InputEvent>,
}

pub struct ShowWindow {
    id: WindowId,
    base_id: i64,
    conn_id: ConnectionId,
    surface: Box<dyn RenderSurface>,
    graph: SceneGraph,
    settings: WindowSettings,
    camera: CameraControl,
    bounds: Bounds,
    status: SurfaceStatus,
    shutdown: bool,
    pub save_flag: bool,
}

impl std::fmt::Debug for ShowWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShowWindow")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("title", &self.settings.title)
            .field("status", &self.status)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl ShowWindow {
    /// Builds a window from a scene message's `data`. A missing camera control
    /// defaults to a trackball.
    pub fn setup(
        data: &Value,
        base_id: i64,
        conn_id: ConnectionId,
        backend: &mut dyn RenderBackend,
    ) -> AppResult<ShowWindow> {
        let settings = WindowSettings::from_scene_data(data)?;
        let camera = CameraControl::from_scene_data(data)?.unwrap_or_default();
        let id = composite_id(base_id, conn_id);

        let mut surface = backend.create_surface(id, &settings)?;
        surface.apply_settings(&settings);
        surface.set_camera_control(&camera);
        let graph = SceneGraph::with_anchors();
        for anchor in Anchor::ALL {
            if let Some(node) = graph.anchor(anchor) {
                surface.register_anchor(node, anchor);
            }
        }
        info!(window_id = id, "window created: {}", settings.title);

        Ok(ShowWindow {
            id,
            base_id,
            conn_id,
            surface,
            graph,
            settings,
            camera,
            bounds: Bounds::default(),
            status: SurfaceStatus::Open,
            shutdown: false,
            save_flag: false,
        })
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    /// The id the producing peer knows this window by.
    pub fn base_id(&self) -> i64 {
        self.base_id
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub fn camera(&self) -> &CameraControl {
        &self.camera
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Applies the window and camera parts of a later scene message and shows
    /// the window again.
    pub fn apply_update(&mut self, data: &Value) -> AppResult<()> {
        if data.get("window").is_some() {
            self.settings = WindowSettings::from_scene_data(data)?;
            self.surface.apply_settings(&self.settings);
        }
        if let Some(camera) = CameraControl::from_scene_data(data)? {
            if camera != self.camera {
                self.camera = camera;
                self.surface.set_camera_control(&self.camera);
            }
        }
        self.show();
        Ok(())
    }

    pub fn add_object(
        &mut self,
        id: ObjectId,
        entry: &Value,
        bufs: &[Bytes],
    ) -> AppResult<SceneObject> {
        let desc = ObjectDesc::parse(entry, bufs)?;
        let node = self.graph.add(id.to_string());
        if let Err(e) = self.surface.create_drawable(node, &desc) {
            self.graph.remove(node);
            return Err(e);
        }
        self.surface.set_pose(node, &desc.pose);
        desc.accumulate_bounds(&mut self.bounds)?;
        debug!(window_id = self.id, "object {} created as {}", id, desc.kind);

        let mut object = SceneObject {
            id,
            window: self.id,
            node,
            kind: desc.kind,
            pose: desc.pose,
            scale: None,
            visible: true,
            parent: None,
            serialization: desc.serialization,
        };
        // creation also honours the per-object update fields
        self.update_object(&mut object, entry)?;
        Ok(object)
    }

    /// Applies `pose`, `scale` and `show` when present.
    pub fn update_object(&mut self, object: &mut SceneObject, entry: &Value) -> AppResult<()> {
        if let Some(pose) = entry.get("pose") {
            object.pose = Pose::from_json(pose)?;
            self.surface.set_pose(object.node, &object.pose);
        }
        if let Some(scale) = entry.get("scale") {
            let scale = scale
                .as_f64()
                .ok_or_else(|| MalformedProtocol("object scale must be a number".into()))?;
            object.scale = Some(scale);
            self.surface.set_scale(object.node, scale);
        }
        if let Some(show) = entry.get("show") {
            let visible = show
                .as_bool()
                .ok_or_else(|| MalformedProtocol("object show must be a bool".into()))?;
            object.visible = visible;
            self.surface.set_visible(object.node, visible);
        }
        Ok(())
    }

    pub fn destroy_object(&mut self, object: &SceneObject) {
        debug!(window_id = self.id, "destroying object {}", object.id);
        self.surface.destroy(object.node);
        self.graph.remove(object.node);
    }

    /// Resolves an anchor name, or a peer-local object id, to a node of this
    /// window.
    pub fn resolve_parent(&self, parent: &str) -> Option<NodeId> {
        if let Some(anchor) = Anchor::from_name(parent) {
            return self.graph.anchor(anchor);
        }
        let raw_id = parent.trim().parse::<i64>().ok()?;
        self.graph
            .find(&composite_id(raw_id, self.conn_id).to_string())
    }

    /// Attaches `object` under `parent`. Unknown parents and cycles are logged
    /// and leave the object where it is.
    pub fn set_parent(&mut self, object: &mut SceneObject, parent: &str) {
        let Some(parent_node) = self.resolve_parent(parent) else {
            warn!(window_id = self.id, "object {} has unknown parent {}", object.id, parent);
            return;
        };
        match self.graph.set_parent(object.node, Some(parent_node)) {
            Ok(()) => {
                self.surface.attach(object.node, Some(parent_node));
                object.parent = Some(parent.to_string());
            }
            Err(e) => warn!(window_id = self.id, "can't reparent object {}: {}", object.id, e),
        }
    }

    pub fn fit_camera_to_bounds(&mut self) {
        if !self.bounds.is_empty() {
            self.surface.fit_camera(&self.bounds);
        }
    }

    pub fn show(&mut self) {
        if !self.shutdown {
            self.surface.show();
            self.status = SurfaceStatus::Open;
        }
    }

    /// Renders one frame. `capture` receives the frame when set.
    pub fn update(&mut self, capture: Option<&Path>) -> AppResult<WindowUpdate> {
        let mut update = WindowUpdate::default();
        if self.shutdown {
            return Ok(update);
        }
        let status = self.surface.render();
        update.inputs = self.surface.poll_input();
        for input in &update.inputs {
            if let InputEvent::KeyPress { key: SAVE_KEY } = input {
                self.save_flag = true;
            }
        }
        match status {
            SurfaceStatus::Closed => {
                info!(window_id = self.id, "window closed by user");
                self.shutdown = true;
                update.closed = true;
            }
            SurfaceStatus::Hidden => {
                update.hidden = self.status != SurfaceStatus::Hidden;
            }
            SurfaceStatus::Open => {
                if let Some(path) = capture {
                    self.surface.capture_frame(path)?;
                }
            }
        }
        self.status = status;
        Ok(update)
    }

    pub fn close(&mut self) {
        if self.shutdown {
            return;
        }
        info!(window_id = self.id, "closing window");
        self.surface.close();
        self.shutdown = true;
    }

    /// A `scene` message body that rebuilds this window from scratch.
    pub fn produce_scene<'a>(
        &self,
        objects: impl IntoIterator<Item = &'a SceneObject>,
    ) -> (Value, Vec<Bytes>) {
        let mut bufs = Vec::new();
        let mut entries = Vec::new();
        for object in objects {
            entries.push(object.produce_json(bufs.len()));
            bufs.extend(object.serialization.payloads.iter().cloned());
        }
        let scene = json!({
            "window_id": self.base_id,
            "window": self.settings,
            "camera": {"control": self.camera},
            "objects": entries,
        });
        (scene, bufs)
    }
}
