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

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tracing::{error, info};
use vephor::{
    setup_file_tracing, setup_local_tracing, AppError, AppResult, HeadlessBackend, ShowConfig,
    ShowRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Client,
    Server,
    #[value(alias = "server_no_daemon")]
    ServerNoDaemon,
}

#[derive(Parser)]
#[command(version, about = "Shows scenes streamed over the network or replayed from disk")]
pub struct CommandLine {
    /// session directory to replay
    #[arg(value_name = "INPUT")]
    pub input: Option<PathBuf>,
    #[arg(short = 'i', long = "input", conflicts_with = "input")]
    pub input_flag: Option<PathBuf>,
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,
    /// host to dial in client mode
    #[arg(short = 'o', long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    /// playback speed multiplier
    #[arg(short = 'P', long)]
    pub speed: Option<f64>,
    /// record every applied message into this directory, which must not exist yet
    #[arg(short = 'R', long)]
    pub record: Option<PathBuf>,
    /// dump every rendered frame into this directory
    #[arg(long)]
    pub video: Option<PathBuf>,
    /// keep running after windows close
    #[arg(short, long)]
    pub daemon: bool,
    /// write logs into this directory instead of the console
    #[arg(short = 'r', long = "redirect")]
    pub log_dir: Option<PathBuf>,
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// stop a file replay once every message has been played
    #[arg(long)]
    pub exit_when_done: bool,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn load_config(commandline: &CommandLine) -> AppResult<ShowConfig> {
    let mut config = match &commandline.conf {
        Some(path) => ShowConfig::set_up_config(path)?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                ShowConfig::set_up_config(default_path)?
            } else {
                ShowConfig::default()
            }
        }
    };

    if let Some(host) = &commandline.host {
        config.network.host = host.clone();
    }
    if let Some(port) = commandline.port {
        config.network.port = port;
    }
    if let Some(speed) = commandline.speed {
        config.show.playback_speed = speed;
    }
    if let Some(record) = &commandline.record {
        if record.exists() {
            return Err(AppError::InvalidValue(format!(
                "record path {} already exists",
                record.display()
            )));
        }
        std::fs::create_dir_all(record)?;
        config.show.record_path = Some(record.clone());
    }
    if let Some(video) = &commandline.video {
        std::fs::create_dir_all(video)?;
        config.show.video_path = Some(video.clone());
    }
    config.show.daemon |= commandline.daemon
        || matches!(commandline.mode, Some(Mode::Client) | Some(Mode::Server));
    config.show.exit_when_replayed |= commandline.exit_when_done;
    config.validate()?;
    Ok(config)
}

fn run(commandline: CommandLine) -> AppResult<()> {
    let config = load_config(&commandline)?;
    let host = config.network.host.clone();
    let port = config.network.port;

    let mut show = ShowRecord::new(config, Box::new(HeadlessBackend::new()))?;
    match commandline.mode {
        Some(Mode::Client) => show.connect_client(&host, port)?,
        Some(Mode::Server) | Some(Mode::ServerNoDaemon) => show.connect_server(port)?,
        None => {
            let input = commandline
                .input
                .or(commandline.input_flag)
                .ok_or_else(|| AppError::InvalidValue("no input dir and no network mode".into()))?;
            show.setup_from_path(&input)?;
        }
    }
    show.spin()?;
    info!("show exiting");
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let log_guard = match &commandline.log_dir {
        Some(dir) => setup_file_tracing(dir, commandline.verbose).map(Some),
        None => setup_local_tracing(commandline.verbose).map(|()| None),
    };
    let _log_guard = match log_guard {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to set up logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(commandline) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("show failed: {}", e);
            eprintln!("vephor-show: {}", e);
            ExitCode::FAILURE
        }
    }
}
