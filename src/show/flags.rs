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

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::AppError::MalformedProtocol;
use crate::AppResult;

#[derive(Debug, Clone, PartialEq)]
pub struct FlagRecord {
    pub name: String,
    /// Toggles flip on click; triggers latch true until the next flags message.
    pub toggle: bool,
    pub state: bool,
}

/// The flag controls one peer declared in its `metadata` message.
#[derive(Debug, Clone)]
pub struct FlagsRecord {
    pub flags: Vec<FlagRecord>,
    last_update: Instant,
}

impl FlagsRecord {
    /// Parses `metadata.flags`, sorted by name.
    pub fn from_metadata(flags: &[Value]) -> AppResult<FlagsRecord> {
        let mut records = flags
            .iter()
            .map(|flag| {
                let name = flag
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MalformedProtocol("flag without name".into()))?;
                Ok(FlagRecord {
                    name: name.to_string(),
                    toggle: flag.get("toggle").and_then(Value::as_bool).unwrap_or(false),
                    state: flag.get("state").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        records.sort_by(|l, r| l.name.cmp(&r.name));
        Ok(FlagsRecord {
            flags: records,
            last_update: Instant::now(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.flags.iter().map(|flag| flag.name.clone()).collect()
    }

    pub fn click(&mut self, name: &str) -> bool {
        let Some(flag) = self.flags.iter_mut().find(|flag| flag.name == name) else {
            return false;
        };
        if flag.toggle {
            flag.state = !flag.state;
        } else {
            flag.state = true;
        }
        true
    }

    pub fn state(&self, name: &str) -> Option<bool> {
        self.flags
            .iter()
            .find(|flag| flag.name == name)
            .map(|flag| flag.state)
    }

    /// Once `interval` has passed, builds the `flags` message and resets every
    /// trigger.
    pub fn take_due_message(&mut self, interval: Duration) -> Option<Value> {
        if self.last_update.elapsed() <= interval {
            return None;
        }
        self.last_update = Instant::now();
        let mut states = Map::new();
        for flag in &mut self.flags {
            states.insert(flag.name.clone(), Value::Bool(flag.state));
            if !flag.toggle {
                flag.state = false;
            }
        }
        Some(json!({"type": "flags", "flags": states}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FlagsRecord {
        FlagsRecord::from_metadata(&[
            json!({"name": "step", "toggle": false}),
            json!({"name": "pause", "toggle": true}),
        ])
        .unwrap()
    }

    #[test]
    fn test_sorted_by_name() {
        assert_eq!(record().names(), vec!["pause".to_string(), "step".to_string()]);
    }

    #[test]
    fn test_click_semantics() {
        let mut flags = record();
        assert!(flags.click("pause"));
        assert!(flags.click("step"));
        assert!(!flags.click("missing"));
        assert_eq!(flags.state("pause"), Some(true));
        assert_eq!(flags.state("step"), Some(true));
        assert!(flags.click("pause"));
        assert_eq!(flags.state("pause"), Some(false));
    }

    #[test]
    fn test_due_message_resets_triggers() {
        let mut flags = record();
        flags.click("step");
        flags.click("pause");
        assert!(flags.take_due_message(Duration::from_secs(3600)).is_none());

        std::thread::sleep(Duration::from_millis(2));
        let msg = flags.take_due_message(Duration::ZERO);
        assert_eq!(
            msg,
            Some(json!({"type": "flags", "flags": {"pause": true, "step": true}}))
        );
        assert_eq!(flags.state("step"), Some(false));
        assert_eq!(flags.state("pause"), Some(true));
    }
}
