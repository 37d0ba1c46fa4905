//! The viewer side: windows, scene objects and the interpreter that applies
//! scene messages to them through a [`RenderBackend`].

pub use flags::{FlagRecord, FlagsRecord};
pub use headless::{HeadlessBackend, RenderCall, SurfaceKey};
pub use object::{composite_id, ObjectDesc, ObjectId, ObjectKind, SceneObject, BASE_BUF_INDEX_KEY};
pub use pose::{Bounds, Pose, Vec3};
pub use render::{
    ButtonState, CameraControl, CameraKind, InputEvent, MouseButton, RenderBackend,
    RenderSurface, SurfaceStatus, WindowSettings,
};
pub use scene_graph::{Anchor, NodeId, SceneGraph, SceneNode};
pub use show_record::{ShowRecord, TickStatus};
pub use vertex::{read_vertex_data, VertexData};
pub use window::{ShowWindow, WindowUpdate, SAVE_KEY};

/// Composite window id: the producer's window id in the low 32 bits, the
/// connection id above.
pub type WindowId = i64;

mod flags;
mod headless;
mod object;
mod pose;
mod render;
mod scene_graph;
mod show_record;
mod vertex;
mod window;
