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

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::network::JsonbMessage;
use crate::AppError::InvalidValue;
use crate::AppResult;

pub const MANIFEST_FILE: &str = "meta.json";
pub const HEADER_FILE: &str = "msg.json";
pub const PAYLOAD_FILE_PREFIX: &str = "msg_buf_";
pub const SCENE_ASSETS_DIR: &str = "scene_assets";

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub messages: Vec<u64>,
}

fn payload_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}{}", PAYLOAD_FILE_PREFIX, index))
}

fn write_file(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    let mut buf_writer = BufWriter::new(file);
    buf_writer.write_all(bytes)?;
    buf_writer.flush()?;
    Ok(())
}

/// Writes `dir/msg.json` and one `dir/msg_buf_<n>` per payload.
pub fn write_jsonb_message_to_dir(dir: &Path, header: &Value, payloads: &[Bytes]) -> AppResult<()> {
    fs::create_dir_all(dir)?;
    let text = serde_json::to_string_pretty(header)?;
    write_file(&dir.join(HEADER_FILE), text.as_bytes())?;
    for (index, payload) in payloads.iter().enumerate() {
        write_file(&payload_path(dir, index), payload)?;
    }
    trace!("wrote message with {} payloads to {:?}", payloads.len(), dir);
    Ok(())
}

/// Reads a message written by [`write_jsonb_message_to_dir`]. Payloads are
/// loaded in order until the first missing index.
pub fn read_jsonb_message_from_dir(dir: &Path) -> AppResult<JsonbMessage> {
    let text = fs::read(dir.join(HEADER_FILE))?;
    let header: Value = serde_json::from_slice(&text)?;
    let mut payloads = Vec::new();
    loop {
        let path = payload_path(dir, payloads.len());
        if !path.is_file() {
            break;
        }
        payloads.push(Bytes::from(fs::read(path)?));
    }
    Ok(JsonbMessage::new(header, payloads))
}

pub fn write_manifest(dir: &Path, manifest: &Manifest) -> AppResult<()> {
    let text = serde_json::to_string_pretty(manifest)?;
    write_file(&dir.join(MANIFEST_FILE), text.as_bytes())
}

pub fn read_manifest(dir: &Path) -> AppResult<Option<Manifest>> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let file = File::open(path)?;
    Ok(Some(serde_json::from_reader(file)?))
}

fn numbered_subdirs(dir: &Path) -> AppResult<Vec<u64>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Loads every message of a recorded session in application order.
///
/// The manifest decides the order when present. Without one, numerically named
/// subdirectories are read in ascending order.
pub fn load_session(dir: &Path) -> AppResult<Vec<JsonbMessage>> {
    if !dir.is_dir() {
        return Err(InvalidValue(format!("session dir {:?} does not exist", dir)));
    }
    let indices = match read_manifest(dir)? {
        Some(manifest) => manifest.messages,
        None => {
            warn!("no {} in {:?}, scanning message dirs", MANIFEST_FILE, dir);
            numbered_subdirs(dir)?
        }
    };
    let mut messages = Vec::with_capacity(indices.len());
    for index in indices {
        messages.push(read_jsonb_message_from_dir(&dir.join(index.to_string()))?);
    }
    debug!("loaded {} messages from {:?}", messages.len(), dir);
    Ok(messages)
}

/// Append-only session writer. The manifest on disk always lists every message
/// appended so far.
#[derive(Debug)]
pub struct MessageStore {
    root: PathBuf,
    manifest: Manifest,
}

impl MessageStore {
    pub fn create(root: impl Into<PathBuf>) -> AppResult<MessageStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = MessageStore {
            root,
            manifest: Manifest::default(),
        };
        write_manifest(&store.root, &store.manifest)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.manifest.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.messages.is_empty()
    }

    pub fn append(&mut self, header: &Value, payloads: &[Bytes]) -> AppResult<u64> {
        let index = self.manifest.messages.len() as u64;
        write_jsonb_message_to_dir(&self.root.join(index.to_string()), header, payloads)?;
        self.manifest.messages.push(index);
        write_manifest(&self.root, &self.manifest)?;
        Ok(index)
    }
}

/// Recursive copy used for `scene_assets` folders.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> AppResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_message_dir_round_trip() -> AppResult<()> {
        let dir = tempdir()?;
        let header = json!({"type": "scene", "conn_id": 0, "time": 0.25});
        let payloads = vec![Bytes::from_static(b"abc"), Bytes::from_static(&[0, 255])];
        write_jsonb_message_to_dir(dir.path(), &header, &payloads)?;

        let msg = read_jsonb_message_from_dir(dir.path())?;
        assert_eq!(msg.header, header);
        assert_eq!(msg.payloads, payloads);
        Ok(())
    }

    #[test]
    fn test_store_manifest_tracks_appends() -> AppResult<()> {
        let dir = tempdir()?;
        let root = dir.path().join("session");
        let mut store = MessageStore::create(&root)?;
        assert_eq!(read_manifest(&root)?, Some(Manifest::default()));

        store.append(&json!({"type": "a"}), &[])?;
        store.append(&json!({"type": "b"}), &[Bytes::from_static(b"x")])?;
        assert_eq!(store.len(), 2);
        assert_eq!(read_manifest(&root)?.unwrap().messages, vec![0, 1]);

        let loaded = load_session(&root)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].message_type(), Some("a"));
        assert_eq!(loaded[1].payloads, vec![Bytes::from_static(b"x")]);
        Ok(())
    }

    #[test]
    fn test_load_without_manifest_sorts_numerically() -> AppResult<()> {
        let dir = tempdir()?;
        for index in [10, 2, 1] {
            write_jsonb_message_to_dir(
                &dir.path().join(index.to_string()),
                &json!({"type": "scene", "n": index}),
                &[],
            )?;
        }
        fs::create_dir_all(dir.path().join(SCENE_ASSETS_DIR))?;

        let loaded = load_session(dir.path())?;
        let order: Vec<i64> = loaded
            .iter()
            .map(|msg| msg.header["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 10]);
        Ok(())
    }

    #[test]
    fn test_missing_session_dir() {
        let dir = tempdir().unwrap();
        assert!(load_session(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_copy_dir_recursive() -> AppResult<()> {
        let src = tempdir()?;
        fs::create_dir_all(src.path().join("nested"))?;
        fs::write(src.path().join("nested").join("tex.png"), b"png")?;
        let dst = tempdir()?;
        copy_dir_recursive(src.path(), &dst.path().join("copy"))?;
        assert_eq!(fs::read(dst.path().join("copy/nested/tex.png"))?, b"png");
        Ok(())
    }
}
