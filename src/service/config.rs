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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub const DEFAULT_PORT: u16 = 5533;
pub const MIN_RANDOM_PORT: u16 = 49152;
pub const MAX_RANDOM_PORT: u16 = 65535;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on one accept poll. Must not exceed one second.
    pub accept_wait_ms: u64,
    /// Upper bound on one receive poll.
    pub receive_wait_ms: u64,
    /// Sleep of the per-connection workers when they have nothing to do.
    pub idle_sleep_ms: u64,
    pub accept_retry_ms: u64,
    pub connect_retry_ms: u64,
    pub worker_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            accept_wait_ms: 100,
            receive_wait_ms: 100,
            idle_sleep_ms: 10,
            accept_retry_ms: 100,
            connect_retry_ms: 100,
            worker_threads: 2,
        }
    }
}

impl NetworkConfig {
    pub fn accept_wait(&self) -> Duration {
        Duration::from_millis(self.accept_wait_ms)
    }
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
    pub fn accept_retry(&self) -> Duration {
        Duration::from_millis(self.accept_retry_ms)
    }
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// Settings of the viewer side that consumes scene messages.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    pub playback_speed: f64,
    pub record_path: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub asset_dir: PathBuf,
    pub video_path: Option<PathBuf>,
    pub daemon: bool,
    pub flags_interval_ms: u64,
    /// Stop a non-daemon file replay once every message has been played.
    pub exit_when_replayed: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            playback_speed: 1.0,
            record_path: None,
            save_dir: std::env::temp_dir().join("vephor").join("save"),
            asset_dir: PathBuf::from("."),
            video_path: None,
            daemon: false,
            flags_interval_ms: 100,
            exit_when_replayed: false,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShowConfig {
    pub network: NetworkConfig,
    pub show: ViewerConfig,
}

impl ShowConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ShowConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let show_config: ShowConfig = config.try_deserialize()?;
        show_config.validate()?;
        Ok(show_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.accept_wait_ms > 1000 {
            return Err(AppError::InvalidValue(format!(
                "accept_wait_ms {} exceeds one second",
                self.network.accept_wait_ms
            )));
        }
        if self.network.worker_threads == 0 {
            return Err(AppError::InvalidValue("worker_threads must be positive".into()));
        }
        if self.show.playback_speed.is_nan() || self.show.playback_speed <= 0.0 {
            return Err(AppError::InvalidValue(format!(
                "playback speed {} must be positive",
                self.show.playback_speed
            )));
        }
        Ok(())
    }

    pub fn flags_interval(&self) -> Duration {
        Duration::from_millis(self.show.flags_interval_ms)
    }
}
