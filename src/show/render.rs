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

//! The seam between the scene interpreter and whatever draws the scene.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::object::ObjectDesc;
use super::pose::{Bounds, Pose};
use super::scene_graph::{Anchor, NodeId};
use super::WindowId;
use crate::network::ConnectionId;
use crate::AppError::MalformedProtocol;
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_position: Option<i64>,
    pub fps: f64,
    pub opacity: f64,
    pub perunit_layout: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        WindowSettings {
            title: "show".to_string(),
            width: None,
            height: None,
            x_position: None,
            y_position: None,
            fps: 60.0,
            opacity: 1.0,
            perunit_layout: false,
        }
    }
}

impl WindowSettings {
    /// Reads `data.window`; absent means defaults.
    pub fn from_scene_data(data: &Value) -> AppResult<WindowSettings> {
        match data.get("window") {
            None | Some(Value::Null) => Ok(WindowSettings::default()),
            Some(window) => serde_json::from_value(window.clone())
                .map_err(|e| MalformedProtocol(format!("bad window settings: {}", e))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Trackball,
    Spin,
    Trajectory,
    Static,
    Plot,
    Plot3d,
}

/// `data.camera.control`: the control type plus its type-specific parameters,
/// kept as given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraControl {
    #[serde(rename = "type")]
    pub kind: CameraKind,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Default for CameraControl {
    fn default() -> Self {
        CameraControl {
            kind: CameraKind::Trackball,
            params: Map::new(),
        }
    }
}

impl CameraControl {
    /// `None` when the message carries no camera control at all.
    pub fn from_scene_data(data: &Value) -> AppResult<Option<CameraControl>> {
        match data.get("camera").and_then(|camera| camera.get("control")) {
            None | Some(Value::Null) => Ok(None),
            Some(control) => serde_json::from_value(control.clone())
                .map(Some)
                .map_err(|e| MalformedProtocol(format!("bad camera control: {}", e))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Open,
    Hidden,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonState {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyPress {
        key: i32,
    },
    KeyRelease {
        key: i32,
    },
    Mouse {
        button: MouseButton,
        state: ButtonState,
        pos: [f64; 2],
        window_size: [f64; 2],
    },
    /// A click on a control panel entry.
    FlagClick {
        name: String,
    },
}

/// One drawable window.
pub trait RenderSurface {
    fn register_anchor(&mut self, node: NodeId, anchor: Anchor);
    fn create_drawable(&mut self, node: NodeId, desc: &ObjectDesc) -> AppResult<()>;
    fn set_pose(&mut self, node: NodeId, pose: &Pose);
    fn set_scale(&mut self, node: NodeId, scale: f64);
    fn set_visible(&mut self, node: NodeId, visible: bool);
    fn attach(&mut self, node: NodeId, parent: Option<NodeId>);
    fn destroy(&mut self, node: NodeId);

    fn apply_settings(&mut self, settings: &WindowSettings);
    fn set_camera_control(&mut self, control: &CameraControl);
    fn fit_camera(&mut self, bounds: &Bounds);
    fn show(&mut self);
    fn close(&mut self);

    /// Draws one frame and reports what the user did to the window.
    fn render(&mut self) -> SurfaceStatus;
    fn capture_frame(&mut self, path: &Path) -> AppResult<()>;
    fn poll_input(&mut self) -> Vec<InputEvent>;
}

pub trait RenderBackend {
    fn create_surface(
        &mut self,
        window_id: WindowId,
        settings: &WindowSettings,
    ) -> AppResult<Box<dyn RenderSurface>>;

    /// Panel listing the flags a peer declared, one clickable entry per name.
    fn create_control_panel(
        &mut self,
        conn_id: ConnectionId,
        title: &str,
        flags: &[String],
    ) -> AppResult<Box<dyn RenderSurface>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_settings() -> AppResult<()> {
        let settings = WindowSettings::from_scene_data(&json!({
            "window": {"title": "plot", "width": 800, "height": 600, "opacity": 0.5}
        }))?;
        assert_eq!(settings.title, "plot");
        assert_eq!(settings.width, Some(800));
        assert_eq!(settings.fps, 60.0);
        assert_eq!(WindowSettings::from_scene_data(&json!({}))?, WindowSettings::default());
        Ok(())
    }

    #[test]
    fn test_camera_control_keeps_params() -> AppResult<()> {
        let control = CameraControl::from_scene_data(&json!({
            "camera": {"control": {"type": "plot3d", "dist": 4.0}}
        }))?
        .unwrap();
        assert_eq!(control.kind, CameraKind::Plot3d);
        assert_eq!(control.params["dist"], 4.0);
        assert_eq!(
            serde_json::to_value(&control)?,
            json!({"type": "plot3d", "dist": 4.0})
        );
        assert!(CameraControl::from_scene_data(&json!({}))?.is_none());
        assert!(CameraControl::from_scene_data(&json!({"camera": {"control": {"type": "fly"}}})).is_err());
        Ok(())
    }
}
