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

//! Vertex and texture references inside object descriptors.
//!
//! A reference is `{"type": "list" | "raw" | "base64", "size": [dim, count], ...}`.
//! `raw` points at a message payload by index, offset by the object's
//! `base_buf_index`. Raw payloads hold `count` vertices of `dim` little-endian f32.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use super::pose::Vec3;
use crate::AppError::MalformedProtocol;
use crate::AppResult;

const FLOAT_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone, PartialEq)]
pub struct VertexData {
    pub dim: usize,
    pub count: usize,
    /// Vertex-major: vertex `i` is `values[i * dim..(i + 1) * dim]`.
    pub values: Vec<f32>,
}

impl VertexData {
    pub fn vertex(&self, i: usize) -> &[f32] {
        &self.values[i * self.dim..(i + 1) * self.dim]
    }

    /// First three coordinates of every vertex, zero-padded.
    pub fn points(&self) -> Vec<Vec3> {
        (0..self.count)
            .map(|i| {
                let v = self.vertex(i);
                let mut p = [0.0; 3];
                for (slot, value) in p.iter_mut().zip(v.iter()) {
                    *slot = *value as f64;
                }
                p
            })
            .collect()
    }
}

fn ref_type(reference: &Value, field: &str) -> AppResult<String> {
    reference
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MalformedProtocol(format!("{} has no type", field)))
}

fn read_size(reference: &Value, field: &str) -> AppResult<(usize, usize)> {
    let size = reference
        .get("size")
        .and_then(Value::as_array)
        .filter(|size| size.len() == 2)
        .ok_or_else(|| MalformedProtocol(format!("{} needs size [dim, count]", field)))?;
    let dim = size[0].as_u64();
    let count = size[1].as_u64();
    match (
        dim.and_then(|d| usize::try_from(d).ok()),
        count.and_then(|c| usize::try_from(c).ok()),
    ) {
        (Some(0), Some(_)) => Err(MalformedProtocol(format!("{} dim must be positive", field))),
        (Some(dim), Some(count)) => Ok((dim, count)),
        _ => Err(MalformedProtocol(format!("{} size must be unsigned", field))),
    }
}

/// Number of floats `dim * count` vertices hold.
fn float_count(dim: usize, count: usize, field: &str) -> AppResult<usize> {
    dim.checked_mul(count)
        .ok_or_else(|| MalformedProtocol(format!("{} size {}x{} overflows", field, dim, count)))
}

/// Index into `bufs` of a `raw` reference.
pub fn raw_buf_index(
    reference: &Value,
    base_buf_index: usize,
    buf_count: usize,
    field: &str,
) -> AppResult<usize> {
    let buf = reference
        .get("buf")
        .and_then(Value::as_u64)
        .ok_or_else(|| MalformedProtocol(format!("{} raw reference has no buf", field)))?;
    let index = usize::try_from(buf)
        .ok()
        .and_then(|buf| base_buf_index.checked_add(buf))
        .ok_or_else(|| MalformedProtocol(format!("{} buf index {} overflows", field, buf)))?;
    if index >= buf_count {
        return Err(MalformedProtocol(format!(
            "{} references payload {} of {}",
            field, index, buf_count
        )));
    }
    Ok(index)
}

fn floats_from_bytes(bytes: &[u8], dim: usize, count: usize, field: &str) -> AppResult<Vec<f32>> {
    let expected = float_count(dim, count, field)?
        .checked_mul(FLOAT_SIZE)
        .ok_or_else(|| MalformedProtocol(format!("{} size {}x{} overflows", field, dim, count)))?;
    if bytes.len() != expected {
        return Err(MalformedProtocol(format!(
            "{} holds {} bytes, expected {}x{} floats",
            field,
            bytes.len(),
            dim,
            count
        )));
    }
    Ok(bytes
        .chunks_exact(FLOAT_SIZE)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn read_vertex_data(
    reference: &Value,
    base_buf_index: usize,
    bufs: &[Bytes],
    field: &str,
) -> AppResult<VertexData> {
    let (dim, count) = read_size(reference, field)?;
    let values = match ref_type(reference, field)?.as_str() {
        "list" => {
            let list = reference
                .get("list")
                .and_then(Value::as_array)
                .ok_or_else(|| MalformedProtocol(format!("{} list is missing", field)))?;
            if list.len() != count {
                return Err(MalformedProtocol(format!(
                    "{} list has {} vertices, expected {}",
                    field,
                    list.len(),
                    count
                )));
            }
            float_count(dim, count, field)?;
            let rows = list
                .iter()
                .map(|vertex| {
                    vertex.as_array().filter(|coords| coords.len() == dim).ok_or_else(|| {
                        MalformedProtocol(format!("{} vertex must have {} coords", field, dim))
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;
            // every row has been checked against dim, so this is bounded by the message
            let mut values = Vec::with_capacity(float_count(rows.len(), dim, field)?);
            for coords in rows {
                for coord in coords {
                    let value = coord
                        .as_f64()
                        .ok_or_else(|| MalformedProtocol(format!("{} coords must be numbers", field)))?;
                    values.push(value as f32);
                }
            }
            values
        }
        "raw" => {
            let index = raw_buf_index(reference, base_buf_index, bufs.len(), field)?;
            floats_from_bytes(&bufs[index], dim, count, field)?
        }
        "base64" => {
            let data = reference
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| MalformedProtocol(format!("{} base64 data is missing", field)))?;
            let bytes = STANDARD
                .decode(data)
                .map_err(|e| MalformedProtocol(format!("{} is not valid base64: {}", field, e)))?;
            floats_from_bytes(&bytes, dim, count, field)?
        }
        other => {
            return Err(MalformedProtocol(format!(
                "{} has unknown vertex data type {}",
                field, other
            )))
        }
    };
    Ok(VertexData { dim, count, values })
}

/// Copies the payload behind a `raw` reference into `serial_bufs` and points the
/// serialized reference at its new slot. Other reference types are
/// self-contained and left untouched.
pub fn rebase_raw_reference(
    reference: &mut Value,
    base_buf_index: usize,
    bufs: &[Bytes],
    serial_bufs: &mut Vec<Bytes>,
    field: &str,
) -> AppResult<()> {
    if reference.get("type").and_then(Value::as_str) != Some("raw") {
        return Ok(());
    }
    let index = raw_buf_index(reference, base_buf_index, bufs.len(), field)?;
    if let Some(obj) = reference.as_object_mut() {
        obj.insert("buf".to_string(), Value::from(serial_bufs.len()));
    }
    serial_bufs.push(bufs[index].clone());
    Ok(())
}

/// Accepts a matrix written as an array of rows, `[[x, y, z], ...]`.
pub fn read_point_rows(value: &Value, field: &str) -> AppResult<Vec<Vec3>> {
    let rows = value
        .as_array()
        .ok_or_else(|| MalformedProtocol(format!("{} must be an array of rows", field)))?;
    rows.iter()
        .map(|row| {
            let coords = row
                .as_array()
                .ok_or_else(|| MalformedProtocol(format!("{} rows must be arrays", field)))?;
            let mut p = [0.0; 3];
            for (slot, coord) in p.iter_mut().zip(coords) {
                *slot = coord
                    .as_f64()
                    .ok_or_else(|| MalformedProtocol(format!("{} coords must be numbers", field)))?;
            }
            Ok(p)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn float_bytes(values: &[f32]) -> Bytes {
        Bytes::from(
            values
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn test_all_encodings_agree() -> AppResult<()> {
        let values = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let bufs = vec![Bytes::from_static(b"unrelated"), float_bytes(&values)];

        let raw = read_vertex_data(
            &json!({"type": "raw", "buf": 0, "size": [3, 2]}),
            1,
            &bufs,
            "verts",
        )?;
        let list = read_vertex_data(
            &json!({"type": "list", "list": [[0, 1, 2], [3, 4, 5]], "size": [3, 2]}),
            0,
            &[],
            "verts",
        )?;
        let encoded = STANDARD.encode(float_bytes(&values));
        let b64 = read_vertex_data(
            &json!({"type": "base64", "data": encoded, "size": [3, 2]}),
            0,
            &[],
            "verts",
        )?;
        assert_eq!(raw, list);
        assert_eq!(raw, b64);
        assert_eq!(raw.points()[1], [3.0, 4.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_raw_out_of_range() {
        let result = read_vertex_data(
            &json!({"type": "raw", "buf": 2, "size": [3, 1]}),
            0,
            &[Bytes::new()],
            "verts",
        );
        assert!(matches!(result, Err(MalformedProtocol(_))));
    }

    #[test]
    fn test_raw_size_mismatch() {
        let result = read_vertex_data(
            &json!({"type": "raw", "buf": 0, "size": [3, 2]}),
            0,
            &[float_bytes(&[1.0, 2.0, 3.0])],
            "verts",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_buf_index_overflow_is_rejected() {
        let result = read_vertex_data(
            &json!({"type": "raw", "buf": u64::MAX, "size": [3, 1]}),
            1,
            &[Bytes::new()],
            "verts",
        );
        assert!(matches!(result, Err(MalformedProtocol(_))));

        let mut reference = json!({"type": "raw", "buf": u64::MAX, "size": [3, 1]});
        let result = rebase_raw_reference(&mut reference, 1, &[Bytes::new()], &mut Vec::new(), "tex");
        assert!(matches!(result, Err(MalformedProtocol(_))));
    }

    #[test]
    fn test_vertex_size_overflow_is_rejected() {
        let huge = 1u64 << 62;
        let raw = read_vertex_data(
            &json!({"type": "raw", "buf": 0, "size": [huge, 4]}),
            0,
            &[float_bytes(&[1.0])],
            "verts",
        );
        assert!(matches!(raw, Err(MalformedProtocol(_))));

        let list = read_vertex_data(
            &json!({"type": "list", "list": [[1.0]], "size": [huge, 1]}),
            0,
            &[],
            "verts",
        );
        assert!(matches!(list, Err(MalformedProtocol(_))));
    }

    #[test]
    fn test_rebase_copies_payload() -> AppResult<()> {
        let bufs = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let mut serial = vec![Bytes::from_static(b"earlier")];
        let mut reference = json!({"type": "raw", "buf": 0, "size": [1, 1]});
        rebase_raw_reference(&mut reference, 1, &bufs, &mut serial, "tex")?;
        assert_eq!(reference["buf"], 1);
        assert_eq!(serial[1], Bytes::from_static(b"b"));

        let mut file_ref = json!({"type": "file", "path": "a.png"});
        rebase_raw_reference(&mut file_ref, 0, &bufs, &mut serial, "tex")?;
        assert_eq!(serial.len(), 2);
        Ok(())
    }
}
