//! On-disk session format shared by recording and file replay.
//!
//! ```text
//! <dir>/meta.json            {"messages": [0, 1, 2, ...]}
//! <dir>/<index>/msg.json     header of message <index>
//! <dir>/<index>/msg_buf_<n>  payload n of message <index>
//! ```

pub use store::{
    copy_dir_recursive, load_session, read_jsonb_message_from_dir, read_manifest,
    write_jsonb_message_to_dir, write_manifest, Manifest, MessageStore, HEADER_FILE,
    MANIFEST_FILE, PAYLOAD_FILE_PREFIX, SCENE_ASSETS_DIR,
};

mod store;
