//! # nv12-gpu
//!
//! Getting NV12 video frames onto the GPU on Linux and turning them into RGB.
//!
//! ## Features
//!
//! - Zero-copy import of NV12 dma-bufs into OpenGL ES through
//!   `EGL_EXT_image_dma_buf_import`, with a plain texture upload fallback
//! - GBM allocation and dma-buf export of linear NV12 buffers
//! - Headless (pbuffer or surfaceless) and Wayland windowed EGL contexts
//! - Shader based and CPU reference NV12 to RGB conversion
//! - Nearest neighbour NV12 scaling with Vulkan compute shaders
//!
//! ## Example
//!
//! ```no_run
//! use nv12_gpu::{
//!     egl_context::{EglContext, SurfaceTarget},
//!     import::{import_or_upload, prepare_dmabuf, EglImporter, ImportBackend},
//!     renderer::Renderer,
//!     types::frame::Nv12Frame,
//! };
//!
//! fn main() -> nv12_gpu::types::error::Result<()> {
//!     let frame = Nv12Frame::white(640, 480)?;
//!     let egl = EglContext::new(SurfaceTarget::Headless {
//!         width: 640,
//!         height: 480,
//!     })?;
//!
//!     // `None` when GBM is unavailable, the upload path is used instead
//!     let dmabuf = prepare_dmabuf("/dev/dri/renderD128", &frame);
//!     let image = dmabuf.as_ref().map(|d| d.image());
//!
//!     let mut importer = EglImporter::new(&egl);
//!     let textures = import_or_upload(&mut importer, &frame, image.as_ref())?;
//!
//!     let renderer = Renderer::new()?;
//!     renderer.draw(&textures, 640, 480)?;
//!     let rgb = renderer.read_rgb(640, 480)?;
//!     assert_eq!(rgb.len(), 640 * 480 * 3);
//!
//!     importer.release(&textures);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod convert;
pub mod dmabuf;
pub mod egl_context;
pub mod gbm_alloc;
pub mod import;
pub mod renderer;
pub mod types;
pub mod utils;
pub mod vulkan;
pub mod window;

pub use convert::Matrix;
pub use import::{BoundTextures, FallbackReason, ImportBackend};
pub use types::{
    error::{Nv12Error, Result},
    frame::{DmaBufImage, FrameLayout, Nv12Frame},
};
