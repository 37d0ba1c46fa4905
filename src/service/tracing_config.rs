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

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

fn env_filter(verbose: u8) -> EnvFilter {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn timer() -> ChronoLocal {
    ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string())
}

/// Console logging for the viewer and for tests.
pub fn setup_local_tracing(verbose: u8) -> AppResult<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(verbose))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;
    Ok(())
}

/// Redirects all log output into `dir/vephor_show.log`.
///
/// The returned guard flushes the non-blocking writer on drop and must be held
/// for the life of the process.
pub fn setup_file_tracing(dir: &Path, verbose: u8) -> AppResult<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::never(dir, "vephor_show.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(verbose))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;
    Ok(worker_guard)
}
