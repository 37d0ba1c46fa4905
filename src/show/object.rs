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

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

use super::pose::{cross_normalized, read_vec, Bounds, Pose};
use super::scene_graph::NodeId;
use super::vertex::{read_point_rows, read_vertex_data, rebase_raw_reference};
use super::WindowId;
use crate::network::{ConnectionId, JsonbMessage};
use crate::AppError::MalformedProtocol;
use crate::AppResult;

pub type ObjectId = i64;

/// Window and object ids from different peers never collide: the peer-local id
/// keeps the low 32 bits and the connection id fills the high bits.
pub fn composite_id(base: i64, conn_id: ConnectionId) -> i64 {
    (base & 0xFFFF_FFFF) | (conn_id << 32)
}

pub const BASE_BUF_INDEX_KEY: &str = "base_buf_index";

/// Header fields that may carry a `raw` payload reference.
/// Slice and stack count used when a descriptor leaves it out.
pub const DEFAULT_TESSELLATION: u64 = 16;

const PAYLOAD_REF_FIELDS: [&str; 4] = ["verts", "colors", "tex", "normal_tex"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Null,
    Lines,
    ThickLines,
    Mesh,
    ObjMesh,
    Sphere,
    Cylinder,
    Cone,
    Cube,
    Plane,
    Arrow,
    Axes,
    Circle,
    Grid,
    Text,
    Particle,
    Sprite,
    DirLight,
    AmbientLight,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 19] = [
        ObjectKind::Null,
        ObjectKind::Lines,
        ObjectKind::ThickLines,
        ObjectKind::Mesh,
        ObjectKind::ObjMesh,
        ObjectKind::Sphere,
        ObjectKind::Cylinder,
        ObjectKind::Cone,
        ObjectKind::Cube,
        ObjectKind::Plane,
        ObjectKind::Arrow,
        ObjectKind::Axes,
        ObjectKind::Circle,
        ObjectKind::Grid,
        ObjectKind::Text,
        ObjectKind::Particle,
        ObjectKind::Sprite,
        ObjectKind::DirLight,
        ObjectKind::AmbientLight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Null => "null",
            ObjectKind::Lines => "lines",
            ObjectKind::ThickLines => "thick_lines",
            ObjectKind::Mesh => "mesh",
            ObjectKind::ObjMesh => "obj_mesh",
            ObjectKind::Sphere => "sphere",
            ObjectKind::Cylinder => "cylinder",
            ObjectKind::Cone => "cone",
            ObjectKind::Cube => "cube",
            ObjectKind::Plane => "plane",
            ObjectKind::Arrow => "arrow",
            ObjectKind::Axes => "axes",
            ObjectKind::Circle => "circle",
            ObjectKind::Grid => "grid",
            ObjectKind::Text => "text",
            ObjectKind::Particle => "particle",
            ObjectKind::Sprite => "sprite",
            ObjectKind::DirLight => "dir_light",
            ObjectKind::AmbientLight => "ambient_light",
        }
    }

    pub fn from_type(name: &str) -> Option<ObjectKind> {
        ObjectKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::Null => &[],
            ObjectKind::Lines | ObjectKind::ThickLines | ObjectKind::Particle => &["verts"],
            ObjectKind::Mesh => &["verts", "norms", "uvs"],
            ObjectKind::ObjMesh => &["path"],
            ObjectKind::Sphere => &["rad"],
            ObjectKind::Cylinder | ObjectKind::Cone => &["rad", "height"],
            ObjectKind::Cube => &["rad"],
            ObjectKind::Plane => &["rads"],
            ObjectKind::Arrow => &["start", "end", "rad"],
            ObjectKind::Axes => &["size"],
            ObjectKind::Circle => &["rad", "thickness"],
            ObjectKind::Grid => &["rad", "normal", "right", "cell_size"],
            ObjectKind::Text => &["text"],
            ObjectKind::Sprite => &["tex"],
            ObjectKind::DirLight => &["dir", "strength"],
            ObjectKind::AmbientLight => &["strength"],
        }
    }

    /// Tessellation counts a descriptor may omit.
    pub fn tessellation_fields(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::Sphere => &["slices", "stacks"],
            ObjectKind::Cylinder | ObjectKind::Cone | ObjectKind::Arrow | ObjectKind::Circle => {
                &["slices"]
            }
            _ => &[],
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn number(desc: &Value, field: &str) -> AppResult<f64> {
    desc.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| MalformedProtocol(format!("{} must be a number", field)))
}

fn field<'a>(desc: &'a Value, field: &str) -> AppResult<&'a Value> {
    desc.get(field)
        .ok_or_else(|| MalformedProtocol(format!("missing field {}", field)))
}

/// A validated object descriptor from a scene message, ready to be built.
#[derive(Debug, Clone)]
pub struct ObjectDesc {
    pub kind: ObjectKind,
    pub pose: Pose,
    pub overlay: bool,
    /// Self-contained copy of the descriptor: raw references point into
    /// `serialization.payloads` and `base_buf_index` is dropped.
    pub serialization: JsonbMessage,
}

impl ObjectDesc {
    pub fn parse(desc: &Value, bufs: &[Bytes]) -> AppResult<ObjectDesc> {
        let type_name = desc
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedProtocol("object without type".into()))?;
        let kind = ObjectKind::from_type(type_name)
            .ok_or_else(|| MalformedProtocol(format!("Invalid object type: {}", type_name)))?;
        for required in kind.required_fields() {
            if desc.get(*required).is_none() {
                return Err(MalformedProtocol(format!(
                    "{} object missing field {}",
                    kind, required
                )));
            }
        }
        let base_buf_index = match desc.get(BASE_BUF_INDEX_KEY) {
            None => 0,
            Some(index) => index
                .as_u64()
                .and_then(|index| usize::try_from(index).ok())
                .ok_or_else(|| MalformedProtocol("base_buf_index must be unsigned".into()))?,
        };

        let mut header = desc.clone();
        if let Some(obj) = header.as_object_mut() {
            for count in kind.tessellation_fields() {
                obj.entry(count.to_string())
                    .or_insert_with(|| Value::from(DEFAULT_TESSELLATION));
            }
        }
        let mut payloads = Vec::new();
        for ref_field in PAYLOAD_REF_FIELDS {
            if let Some(reference) = header.get_mut(ref_field) {
                rebase_raw_reference(reference, base_buf_index, bufs, &mut payloads, ref_field)?;
            }
        }
        if let Some(obj) = header.as_object_mut() {
            obj.remove(BASE_BUF_INDEX_KEY);
        }

        Ok(ObjectDesc {
            kind,
            pose: Pose::from_json(desc.get("pose").unwrap_or(&Value::Null))?,
            overlay: desc.get("overlay").and_then(Value::as_bool).unwrap_or(false),
            serialization: JsonbMessage::new(header, payloads),
        })
    }

    pub fn header(&self) -> &Value {
        &self.serialization.header
    }

    /// Grows `bounds` by this object's extent in world space. Overlay objects
    /// live in screen space and do not count.
    pub fn accumulate_bounds(&self, bounds: &mut Bounds) -> AppResult<()> {
        if self.overlay {
            return Ok(());
        }
        let desc = self.header();
        let bufs = &self.serialization.payloads;
        let pose = &self.pose;
        match self.kind {
            ObjectKind::Lines | ObjectKind::ThickLines | ObjectKind::Particle => {
                let verts = read_vertex_data(field(desc, "verts")?, 0, bufs, "verts")?;
                bounds.add_points(&verts.points(), pose);
            }
            ObjectKind::Mesh => {
                bounds.add_points(&read_point_rows(field(desc, "verts")?, "verts")?, pose);
            }
            ObjectKind::Sphere | ObjectKind::Cube | ObjectKind::Circle => {
                bounds.add_sphere(number(desc, "rad")?, pose);
            }
            ObjectKind::Cylinder | ObjectKind::Cone => {
                let rad = number(desc, "rad")?;
                let height = number(desc, "height")?;
                bounds.add_sphere(rad.max(height / 2.0), pose);
            }
            ObjectKind::Arrow => {
                let start: [f64; 3] = read_vec(field(desc, "start")?, "start")?;
                let end: [f64; 3] = read_vec(field(desc, "end")?, "end")?;
                let dist = ((end[0] - start[0]).powi(2)
                    + (end[1] - start[1]).powi(2)
                    + (end[2] - start[2]).powi(2))
                .sqrt();
                bounds.add_sphere(number(desc, "rad")?.max(dist / 2.0), pose);
            }
            ObjectKind::Axes => bounds.add_sphere(number(desc, "size")?, pose),
            ObjectKind::Plane => {
                let rads: [f64; 2] = read_vec(field(desc, "rads")?, "rads")?;
                for (x, y) in [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)] {
                    bounds.add_point([x * rads[0], y * rads[1], 0.0], pose);
                }
            }
            ObjectKind::Grid => {
                let rad = number(desc, "rad")?;
                let normal = read_vec(field(desc, "normal")?, "normal")?;
                let right: [f64; 3] = read_vec(field(desc, "right")?, "right")?;
                let forward = cross_normalized(normal, right);
                for (f, r) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)] {
                    let p = [
                        rad * (f * forward[0] + r * right[0]),
                        rad * (f * forward[1] + r * right[1]),
                        rad * (f * forward[2] + r * right[2]),
                    ];
                    bounds.add_point(p, pose);
                }
            }
            ObjectKind::Sprite => {
                let aspect = desc
                    .get("tex")
                    .and_then(|tex| tex.get("size"))
                    .and_then(|size| read_vec::<2>(size, "tex.size").ok())
                    .filter(|size| size[1] > 0.0)
                    .map(|size| size[0] / size[1])
                    .unwrap_or(1.0);
                for (x, y) in [(-0.5, -0.5), (-0.5, 0.5), (0.5, 0.5), (0.5, -0.5)] {
                    bounds.add_point([x * aspect, y, 0.0], pose);
                }
            }
            ObjectKind::Null
            | ObjectKind::ObjMesh
            | ObjectKind::Text
            | ObjectKind::DirLight
            | ObjectKind::AmbientLight => {}
        }
        Ok(())
    }
}

/// A live object on the viewer side.
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub id: ObjectId,
    pub window: WindowId,
    pub node: NodeId,
    pub kind: ObjectKind,
    pub pose: Pose,
    pub scale: Option<f64>,
    pub visible: bool,
    pub parent: Option<String>,
    pub serialization: JsonbMessage,
}

impl SceneObject {
    /// The cached descriptor with the current pose, scale, visibility and parent,
    /// its payloads re-based to start at `base_buf_index`.
    pub fn produce_json(&self, base_buf_index: usize) -> Value {
        let mut header = self.serialization.header.clone();
        if let Some(obj) = header.as_object_mut() {
            obj.insert("pose".to_string(), self.pose.to_json());
            obj.insert("show".to_string(), Value::Bool(self.visible));
            if let Some(scale) = self.scale {
                obj.insert("scale".to_string(), Value::from(scale));
            }
            match &self.parent {
                Some(parent) => {
                    obj.insert("pose_parent".to_string(), Value::from(parent.as_str()));
                }
                None => {
                    obj.remove("pose_parent");
                }
            }
            obj.remove("destroy");
            if base_buf_index > 0 {
                obj.insert(BASE_BUF_INDEX_KEY.to_string(), Value::from(base_buf_index));
            }
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_composite_id() {
        assert_eq!(composite_id(5, 0), 5);
        assert_eq!(composite_id(5, 2), 5 | (2 << 32));
        assert_ne!(composite_id(1, 1), composite_id(1, 2));
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ObjectKind::ALL {
            assert_eq!(ObjectKind::from_type(kind.as_str()), Some(kind));
        }
        assert_eq!(ObjectKind::from_type("teapot"), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ObjectDesc::parse(&json!({"id": 1, "type": "teapot"}), &[]).unwrap_err();
        assert!(err.to_string().contains("Invalid object type"));
    }

    #[test]
    fn test_missing_required_field() {
        let result = ObjectDesc::parse(&json!({"id": 1, "type": "sphere", "slices": 8}), &[]);
        assert!(matches!(result, Err(MalformedProtocol(_))));
        let result = ObjectDesc::parse(&json!({"id": 1, "type": "cone", "rad": 1.0}), &[]);
        assert!(matches!(result, Err(MalformedProtocol(_))));
    }

    #[test]
    fn test_tessellation_defaults() -> AppResult<()> {
        let sphere = ObjectDesc::parse(
            &json!({"id": 5, "type": "sphere", "rad": 1.0, "pose": {"t": [0, 0, 0]}}),
            &[],
        )?;
        assert_eq!(sphere.header()["slices"], DEFAULT_TESSELLATION);
        assert_eq!(sphere.header()["stacks"], DEFAULT_TESSELLATION);

        let circle = ObjectDesc::parse(
            &json!({"id": 6, "type": "circle", "rad": 1.0, "thickness": 0.1, "slices": 32}),
            &[],
        )?;
        assert_eq!(circle.header()["slices"], 32);
        assert!(circle.header().get("stacks").is_none());
        Ok(())
    }

    #[test]
    fn test_raw_payloads_rebased() -> AppResult<()> {
        let bufs = vec![
            Bytes::from_static(b"other object"),
            Bytes::from(vec![0u8; 12]),
            Bytes::from(vec![1u8; 12]),
        ];
        let desc = json!({
            "id": 3,
            "type": "lines",
            "base_buf_index": 1,
            "verts": {"type": "raw", "buf": 1, "size": [3, 1]},
            "colors": {"type": "raw", "buf": 0, "size": [3, 1]},
        });
        let parsed = ObjectDesc::parse(&desc, &bufs)?;
        let header = parsed.header();
        assert!(header.get("base_buf_index").is_none());
        assert_eq!(header["verts"]["buf"], 0);
        assert_eq!(header["colors"]["buf"], 1);
        assert_eq!(parsed.serialization.payloads, vec![bufs[2].clone(), bufs[1].clone()]);
        Ok(())
    }

    #[test]
    fn test_sphere_bounds() -> AppResult<()> {
        let parsed = ObjectDesc::parse(
            &json!({"id": 5, "type": "sphere", "rad": 2.0, "slices": 8, "stacks": 8,
                    "pose": {"t": [1, 0, 0]}}),
            &[],
        )?;
        let mut bounds = Bounds::default();
        parsed.accumulate_bounds(&mut bounds)?;
        assert_eq!(bounds.min, [-1.0, -2.0, -2.0]);
        assert_eq!(bounds.max, [3.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_overlay_has_no_bounds() -> AppResult<()> {
        let parsed = ObjectDesc::parse(
            &json!({"id": 1, "type": "cube", "rad": 1.0, "overlay": true}),
            &[],
        )?;
        let mut bounds = Bounds::default();
        parsed.accumulate_bounds(&mut bounds)?;
        assert!(bounds.is_empty());
        Ok(())
    }
}
