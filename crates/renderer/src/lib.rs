//! Frame gating across tile grids and GPU texture upload.
//!
//! - `context`: [`RenderContext`] collects per-grid readiness and presents a
//!   composed frame once every visible grid has reported.
//! - `gpu`: wgpu textures for decoded tiles and the fetcher that uploads
//!   them on the owning thread.

mod context;
mod gpu;

pub use context::{FrameStatus, RenderContext, RenderContextError};
pub use gpu::{
    GpuTexture, GpuTextureFetcher, GpuTileUploader, HeadlessDeviceError, TILE_TEXTURE_FORMAT,
    create_headless_device,
};
