pub mod network;
pub mod record;
pub mod service;
pub mod show;

pub use network::{ConnectionId, JsonbMessage, NetworkManager};
pub use record::MessageStore;
pub use service::{
    setup_file_tracing, setup_local_tracing, AppError, AppResult, NetworkConfig, ShowConfig,
    ViewerConfig,
};
pub use show::{HeadlessBackend, ShowRecord, TickStatus};
