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

use serde_json::{json, Value};

use crate::AppError::MalformedProtocol;
use crate::AppResult;

pub type Vec3 = [f64; 3];

pub fn read_vec<const N: usize>(value: &Value, field: &str) -> AppResult<[f64; N]> {
    let items = value
        .as_array()
        .filter(|items| items.len() == N)
        .ok_or_else(|| MalformedProtocol(format!("{} must be an array of {} numbers", field, N)))?;
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_f64()
            .ok_or_else(|| MalformedProtocol(format!("{} must hold numbers", field)))?;
    }
    Ok(out)
}

/// Rigid transform with uniform scale: `t + scale * R(r) * p`, where `r` is an
/// axis-angle vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            translation: [0.0; 3],
            rotation: [0.0; 3],
            scale: 1.0,
        }
    }
}

impl Pose {
    /// Parses `{"t": [x, y, z], "r": [ax, ay, az], "scale": s}`; every field is
    /// optional.
    pub fn from_json(value: &Value) -> AppResult<Pose> {
        if value.is_null() {
            return Ok(Pose::default());
        }
        if !value.is_object() {
            return Err(MalformedProtocol("pose must be an object".into()));
        }
        let mut pose = Pose::default();
        if let Some(t) = value.get("t") {
            pose.translation = read_vec(t, "pose.t")?;
        }
        if let Some(r) = value.get("r") {
            pose.rotation = read_vec(r, "pose.r")?;
        }
        if let Some(scale) = value.get("scale") {
            pose.scale = scale
                .as_f64()
                .ok_or_else(|| MalformedProtocol("pose.scale must be a number".into()))?;
        }
        Ok(pose)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "t": self.translation,
            "r": self.rotation,
            "scale": self.scale,
        })
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        let rotated = rotate(self.rotation, p);
        [
            self.translation[0] + self.scale * rotated[0],
            self.translation[1] + self.scale * rotated[1],
            self.translation[2] + self.scale * rotated[2],
        ]
    }
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn normalized(v: Vec3) -> Vec3 {
    let norm = dot(v, v).sqrt();
    if norm == 0.0 {
        return v;
    }
    [v[0] / norm, v[1] / norm, v[2] / norm]
}

pub fn cross_normalized(a: Vec3, b: Vec3) -> Vec3 {
    normalized(cross(a, b))
}

// Rodrigues rotation
fn rotate(axis_angle: Vec3, p: Vec3) -> Vec3 {
    let angle = dot(axis_angle, axis_angle).sqrt();
    if angle < 1e-12 {
        return p;
    }
    let k = [
        axis_angle[0] / angle,
        axis_angle[1] / angle,
        axis_angle[2] / angle,
    ];
    let (sin, cos) = angle.sin_cos();
    let k_cross_p = cross(k, p);
    let k_dot_p = dot(k, p);
    [
        p[0] * cos + k_cross_p[0] * sin + k[0] * k_dot_p * (1.0 - cos),
        p[1] * cos + k_cross_p[1] * sin + k[1] * k_dot_p * (1.0 - cos),
        p[2] * cos + k_cross_p[2] * sin + k[2] * k_dot_p * (1.0 - cos),
    ]
}

/// Axis-aligned world bound. Starts empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            min: [f64::MAX; 3],
            max: [f64::MIN; 3],
        }
    }
}

impl Bounds {
    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0]
    }

    pub fn add_point(&mut self, local: Vec3, world_from_body: &Pose) {
        let p = world_from_body.transform_point(local);
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    pub fn add_sphere(&mut self, rad: f64, world_from_body: &Pose) {
        for axis in 0..3 {
            for sign in [-1.0, 1.0] {
                let mut p = [0.0; 3];
                p[axis] = sign * rad;
                self.add_point(p, world_from_body);
            }
        }
    }

    /// Adds the eight corners of the local box spanned by `points`.
    pub fn add_points(&mut self, points: &[Vec3], world_from_body: &Pose) {
        let Some(first) = points.first() else {
            return;
        };
        let mut local = Bounds {
            min: *first,
            max: *first,
        };
        for p in points {
            for i in 0..3 {
                local.min[i] = local.min[i].min(p[i]);
                local.max[i] = local.max[i].max(p[i]);
            }
        }
        for corner in local.corners() {
            self.add_point(corner, world_from_body);
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            [lo[0], lo[1], lo[2]],
            [lo[0], lo[1], hi[2]],
            [lo[0], hi[1], lo[2]],
            [hi[0], lo[1], lo[2]],
            [hi[0], hi[1], lo[2]],
            [hi[0], lo[1], hi[2]],
            [lo[0], hi[1], hi[2]],
            [hi[0], hi[1], hi[2]],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn close(a: Vec3, b: Vec3) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_pose_parse_defaults() -> AppResult<()> {
        let pose = Pose::from_json(&json!({"t": [1, 2, 3]}))?;
        assert_eq!(pose.translation, [1.0, 2.0, 3.0]);
        assert_eq!(pose.rotation, [0.0; 3]);
        assert_eq!(pose.scale, 1.0);
        assert_eq!(Pose::from_json(&Value::Null)?, Pose::default());
        assert!(Pose::from_json(&json!({"t": [1, 2]})).is_err());
        Ok(())
    }

    #[test]
    fn test_rotation_about_z() {
        let pose = Pose {
            translation: [1.0, 0.0, 0.0],
            rotation: [0.0, 0.0, FRAC_PI_2],
            scale: 2.0,
        };
        assert!(close(pose.transform_point([1.0, 0.0, 0.0]), [1.0, 2.0, 0.0]));
    }

    #[test]
    fn test_bounds_sphere() {
        let mut bounds = Bounds::default();
        assert!(bounds.is_empty());
        let pose = Pose {
            translation: [0.0, 0.0, 5.0],
            ..Pose::default()
        };
        bounds.add_sphere(1.0, &pose);
        assert!(!bounds.is_empty());
        assert_eq!(bounds.min, [-1.0, -1.0, 4.0]);
        assert_eq!(bounds.max, [1.0, 1.0, 6.0]);
    }
}
