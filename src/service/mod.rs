pub use app_error::{AppError, AppResult};
pub use config::{
    NetworkConfig, ShowConfig, ViewerConfig, DEFAULT_PORT, MAX_RANDOM_PORT, MIN_RANDOM_PORT,
};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use tracing_config::{setup_file_tracing, setup_local_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
