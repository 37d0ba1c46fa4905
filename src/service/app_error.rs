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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// network errors
    #[error("mode conflict: {0}")]
    ModeConflict(String),

    #[error("unknown connection id: {0}")]
    UnknownConnection(i64),

    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error("accept error: {0}")]
    Accept(String),
}

impl AppError {
    /// Protocol errors are the ones a well-formed peer never produces.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, AppError::MalformedProtocol(_))
    }
}
