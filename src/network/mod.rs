//! Network Module Implementation
//!
//! TCP transport for scene messages: a framed byte stream, the JSONB message
//! codec on top of it, and a connection manager that runs one inbound and one
//! outbound worker per peer.
//!
//! # Components
//!
//! - `FrameReader`/`FrameWriter`: bounded-wait reads and chunked writes of
//!   length-prefixed frames
//! - `JsonbMessage`: a JSON header plus binary payloads
//! - `NetworkManager`: client or server mode, connection ids, per-connection
//!   queues and teardown
//!
//! All integers on the wire are 8 byte little-endian.

pub use connection::{ConnectionId, LOCAL_CONN_ID};
pub use frame::{FrameReader, FrameWriter, LinkState, LENGTH_FIELD_SIZE, SEND_CHUNK_SIZE};
pub use jsonb::{total_length, JsonbMessage, CONN_ID_KEY, DISCONNECT_TYPE, TIME_KEY, TYPE_KEY};
pub use manager::{ManagerMode, NetworkManager};
pub use socket::{ListenSocket, TcpSocket};

mod connection;
mod frame;
mod jsonb;
mod manager;
mod socket;
