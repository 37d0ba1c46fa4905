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

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::object::{ObjectDesc, ObjectKind};
use super::pose::{Bounds, Pose};
use super::render::{
    CameraControl, InputEvent, RenderBackend, RenderSurface, SurfaceStatus, WindowSettings,
};
use super::scene_graph::{Anchor, NodeId};
use super::WindowId;
use crate::network::ConnectionId;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKey {
    Window(WindowId),
    Control(ConnectionId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    CreateSurface { title: String },
    RegisterAnchor { node: NodeId, anchor: Anchor },
    CreateDrawable { node: NodeId, kind: ObjectKind },
    SetPose { node: NodeId, pose: Pose },
    SetScale { node: NodeId, scale: f64 },
    SetVisible { node: NodeId, visible: bool },
    Attach { node: NodeId, parent: Option<NodeId> },
    Destroy { node: NodeId },
    ApplySettings(WindowSettings),
    SetCamera(CameraControl),
    FitCamera(Bounds),
    Show,
    Close,
    Render,
    Capture(PathBuf),
}

#[derive(Debug, Default)]
struct HeadlessState {
    calls: Vec<(SurfaceKey, RenderCall)>,
    status: HashMap<SurfaceKey, SurfaceStatus>,
    input: HashMap<SurfaceKey, Vec<InputEvent>>,
}

/// Backend without a display. Every call is logged, and clones of the backend
/// share the log so tests can inspect it and play the user: close or hide a
/// window, press keys, click flags.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessBackend {
    pub fn new() -> HeadlessBackend {
        HeadlessBackend::default()
    }

    pub fn calls(&self) -> Vec<(SurfaceKey, RenderCall)> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, key: SurfaceKey) -> Vec<RenderCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&RenderCall) -> bool) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| pred(call))
            .count()
    }

    pub fn close_window(&self, key: SurfaceKey) {
        self.state.lock().status.insert(key, SurfaceStatus::Closed);
    }

    pub fn hide_window(&self, key: SurfaceKey) {
        self.state.lock().status.insert(key, SurfaceStatus::Hidden);
    }

    pub fn push_input(&self, key: SurfaceKey, event: InputEvent) {
        self.state.lock().input.entry(key).or_default().push(event);
    }

    fn surface(&self, key: SurfaceKey, title: &str) -> Box<dyn RenderSurface> {
        let mut state = self.state.lock();
        state.status.insert(key, SurfaceStatus::Open);
        state.calls.push((
            key,
            RenderCall::CreateSurface {
                title: title.to_string(),
            },
        ));
        Box::new(HeadlessSurface {
            key,
            state: self.state.clone(),
        })
    }
}

impl RenderBackend for HeadlessBackend {
    fn create_surface(
        &mut self,
        window_id: WindowId,
        settings: &WindowSettings,
    ) -> AppResult<Box<dyn RenderSurface>> {
        Ok(self.surface(SurfaceKey::Window(window_id), &settings.title))
    }

    fn create_control_panel(
        &mut self,
        conn_id: ConnectionId,
        title: &str,
        _flags: &[String],
    ) -> AppResult<Box<dyn RenderSurface>> {
        Ok(self.surface(SurfaceKey::Control(conn_id), title))
    }
}

#[derive(Debug)]
struct HeadlessSurface {
    key: SurfaceKey,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessSurface {
    fn log(&self, call: RenderCall) {
        trace!("{:?}: {:?}", self.key, call);
        self.state.lock().calls.push((self.key, call));
    }
}

impl RenderSurface for HeadlessSurface {
    fn register_anchor(&mut self, node: NodeId, anchor: Anchor) {
        self.log(RenderCall::RegisterAnchor { node, anchor });
    }
    fn create_drawable(&mut self, node: NodeId, desc: &ObjectDesc) -> AppResult<()> {
        self.log(RenderCall::CreateDrawable {
            node,
            kind: desc.kind,
        });
        Ok(())
    }
    fn set_pose(&mut self, node: NodeId, pose: &Pose) {
        self.log(RenderCall::SetPose { node, pose: *pose });
    }
    fn set_scale(&mut self, node: NodeId, scale: f64) {
        self.log(RenderCall::SetScale { node, scale });
    }
    fn set_visible(&mut self, node: NodeId, visible: bool) {
        self.log(RenderCall::SetVisible { node, visible });
    }
    fn attach(&mut self, node: NodeId, parent: Option<NodeId>) {
        self.log(RenderCall::Attach { node, parent });
    }
    fn destroy(&mut self, node: NodeId) {
        self.log(RenderCall::Destroy { node });
    }

    fn apply_settings(&mut self, settings: &WindowSettings) {
        self.log(RenderCall::ApplySettings(settings.clone()));
    }
    fn set_camera_control(&mut self, control: &CameraControl) {
        self.log(RenderCall::SetCamera(control.clone()));
    }
    fn fit_camera(&mut self, bounds: &Bounds) {
        self.log(RenderCall::FitCamera(*bounds));
    }
    fn show(&mut self) {
        self.log(RenderCall::Show);
        let mut state = self.state.lock();
        if state.status.get(&self.key) == Some(&SurfaceStatus::Hidden) {
            state.status.insert(self.key, SurfaceStatus::Open);
        }
    }
    fn close(&mut self) {
        self.log(RenderCall::Close);
        self.state.lock().status.insert(self.key, SurfaceStatus::Closed);
    }

    fn render(&mut self) -> SurfaceStatus {
        self.log(RenderCall::Render);
        self.state
            .lock()
            .status
            .get(&self.key)
            .copied()
            .unwrap_or(SurfaceStatus::Open)
    }
    fn capture_frame(&mut self, path: &Path) -> AppResult<()> {
        self.log(RenderCall::Capture(path.to_path_buf()));
        Ok(())
    }
    fn poll_input(&mut self) -> Vec<InputEvent> {
        self.state
            .lock()
            .input
            .remove(&self.key)
            .unwrap_or_default()
    }
}
