//! Getting an NV12 frame onto the GPU: zero-copy dma-buf import when the
//! driver allows it, plain texture upload otherwise.

use std::{
    fmt,
    os::fd::{AsFd, OwnedFd},
    path::Path,
};

use khronos_egl as egl;

use crate::{
    egl_context::{EglContext, TEXTURE_EXTERNAL_OES},
    gbm_alloc::{Nv12Buffer, RenderNode},
    renderer,
    types::{
        error::Result,
        frame::{DmaBufImage, Nv12Frame},
    },
};

/// The GPU operations the import procedure needs.
pub trait ImportBackend {
    /// Whether dma-buf import is worth attempting at all.
    fn supports_dmabuf_import(&self) -> bool;

    /// Imports the buffer and binds it to a new external texture.
    fn import_dmabuf(&mut self, image: &DmaBufImage) -> Result<u32>;

    /// Uploads the planes into a single channel luma texture and a two
    /// channel chroma texture, returned in that order.
    fn upload_planes(&mut self, frame: &Nv12Frame) -> Result<(u32, u32)>;

    fn release(&mut self, textures: &BoundTextures);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The display does not advertise dma-buf import.
    Unsupported,
    /// No dma-buf could be allocated, exported or filled.
    NoBuffer,
    /// The driver refused the import.
    ImportFailed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Unsupported => write!(f, "dma-buf import not supported"),
            FallbackReason::NoBuffer => write!(f, "no dma-buf available"),
            FallbackReason::ImportFailed(msg) => write!(f, "import failed: {msg}"),
        }
    }
}

/// Textures ready for sampling, and how they got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundTextures {
    /// The whole frame behind one external texture; the driver converts to RGB.
    External { texture: u32 },
    /// Uploaded planes, converted to RGB in the fragment shader.
    Planes {
        luma: u32,
        chroma: u32,
        reason: FallbackReason,
    },
}

impl BoundTextures {
    pub fn is_zero_copy(&self) -> bool {
        matches!(self, BoundTextures::External { .. })
    }
}

/// Binds `frame` for sampling. The dma-buf is tried first when one is given
/// and the backend supports it; any failure there falls back to uploading
/// `frame` directly. Only a failed upload is an error.
pub fn import_or_upload<B: ImportBackend>(
    backend: &mut B,
    frame: &Nv12Frame,
    dmabuf: Option<&DmaBufImage>,
) -> Result<BoundTextures> {
    let reason = match dmabuf {
        _ if !backend.supports_dmabuf_import() => FallbackReason::Unsupported,
        None => FallbackReason::NoBuffer,
        Some(image) => match backend.import_dmabuf(image) {
            Ok(texture) => {
                log::info!("Zero-copy: dma-buf imported as external texture {texture}");
                return Ok(BoundTextures::External { texture });
            }
            Err(e) => {
                log::warn!("dma-buf import failed, uploading instead: {e}");
                FallbackReason::ImportFailed(e.to_string())
            }
        },
    };

    let (luma, chroma) = backend.upload_planes(frame)?;
    log::info!("Fallback upload ({reason}): luma texture {luma}, chroma texture {chroma}");
    Ok(BoundTextures::Planes {
        luma,
        chroma,
        reason,
    })
}

/// A filled, exported GBM buffer and its EGL description.
pub struct PreparedDmaBuf {
    image: DmaBufImage,
    // The description refers to this descriptor and buffer object.
    _fd: OwnedFd,
    _buffer: Nv12Buffer,
}

impl PreparedDmaBuf {
    pub fn image(&self) -> DmaBufImage {
        self.image.clone()
    }
}

/// Allocates a GBM buffer on `render_node`, exports it and copies `frame`
/// into it. Returns `None` when any of that fails; the caller then uploads.
pub fn prepare_dmabuf<P: AsRef<Path>>(render_node: P, frame: &Nv12Frame) -> Option<PreparedDmaBuf> {
    let prepare = || -> Result<PreparedDmaBuf> {
        let node = RenderNode::open(render_node.as_ref())?;
        let buffer = Nv12Buffer::allocate(node, frame.width(), frame.height())?;
        let fd = buffer.export()?;
        buffer.fill(fd.as_fd(), frame)?;
        let image = buffer.image_description(fd.as_fd())?;
        Ok(PreparedDmaBuf {
            image,
            _fd: fd,
            _buffer: buffer,
        })
    };

    match prepare() {
        Ok(prepared) => Some(prepared),
        Err(e) => {
            log::warn!("No dma-buf for this frame: {e}");
            None
        }
    }
}

/// [`ImportBackend`] over a current EGL context.
pub struct EglImporter<'a> {
    egl: &'a EglContext,
    images: Vec<egl::Image>,
}

impl<'a> EglImporter<'a> {
    pub fn new(egl: &'a EglContext) -> Self {
        Self {
            egl,
            images: Vec::new(),
        }
    }
}

impl ImportBackend for EglImporter<'_> {
    fn supports_dmabuf_import(&self) -> bool {
        self.egl.supports_dmabuf_import()
    }

    fn import_dmabuf(&mut self, image: &DmaBufImage) -> Result<u32> {
        let egl_image = self.egl.create_image_from_dmabuf(image)?;
        match self.egl.bind_image_to_texture(egl_image, TEXTURE_EXTERNAL_OES) {
            Ok(texture) => {
                self.images.push(egl_image);
                Ok(texture)
            }
            Err(e) => {
                warn_on_failure("unbound EGL image", self.egl.destroy_image(egl_image));
                Err(e)
            }
        }
    }

    fn upload_planes(&mut self, frame: &Nv12Frame) -> Result<(u32, u32)> {
        let (width, height) = (frame.width() as i32, frame.height() as i32);
        let luma = renderer::upload_texture(gl::R8, gl::RED, width, height, frame.y_plane())?;
        let chroma =
            match renderer::upload_texture(gl::RG8, gl::RG, width / 2, height / 2, frame.uv_plane())
            {
                Ok(chroma) => chroma,
                Err(e) => {
                    self.egl.delete_texture(luma);
                    return Err(e);
                }
            };
        Ok((luma, chroma))
    }

    fn release(&mut self, textures: &BoundTextures) {
        match textures {
            BoundTextures::External { texture } => self.egl.delete_texture(*texture),
            BoundTextures::Planes { luma, chroma, .. } => {
                self.egl.delete_texture(*luma);
                self.egl.delete_texture(*chroma);
            }
        }
        for image in self.images.drain(..) {
            warn_on_failure("EGL image", self.egl.destroy_image(image));
        }
    }
}

/// Teardown errors are logged, never returned. True when `result` failed.
fn warn_on_failure(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) => {
            log::warn!("Releasing {what}: {e}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{error::Nv12Error, frame::FrameLayout};

    #[derive(Default)]
    struct FakeBackend {
        supported: bool,
        import_fails: bool,
        upload_fails: bool,
        imports: usize,
        uploads: usize,
        next_texture: u32,
    }

    impl FakeBackend {
        fn texture(&mut self) -> u32 {
            self.next_texture += 1;
            self.next_texture
        }
    }

    impl ImportBackend for FakeBackend {
        fn supports_dmabuf_import(&self) -> bool {
            self.supported
        }

        fn import_dmabuf(&mut self, _image: &DmaBufImage) -> Result<u32> {
            self.imports += 1;
            if self.import_fails {
                return Err(Nv12Error::Import("EGL_BAD_MATCH".into()));
            }
            Ok(self.texture())
        }

        fn upload_planes(&mut self, _frame: &Nv12Frame) -> Result<(u32, u32)> {
            self.uploads += 1;
            if self.upload_fails {
                return Err(Nv12Error::Gl("GL_OUT_OF_MEMORY".into()));
            }
            Ok((self.texture(), self.texture()))
        }

        fn release(&mut self, _textures: &BoundTextures) {}
    }

    fn frame_and_image() -> (Nv12Frame, DmaBufImage) {
        let frame = Nv12Frame::white(64, 64).unwrap();
        let image = DmaBufImage::nv12(5, 64, 64, &FrameLayout::packed(64, 64)).unwrap();
        (frame, image)
    }

    #[test]
    fn missing_extension_falls_back_and_still_binds() {
        let (frame, image) = frame_and_image();
        let mut backend = FakeBackend::default();

        let bound = import_or_upload(&mut backend, &frame, Some(&image)).unwrap();
        assert_eq!(
            bound,
            BoundTextures::Planes {
                luma: 1,
                chroma: 2,
                reason: FallbackReason::Unsupported
            }
        );
        assert_eq!(backend.imports, 0);
        assert_eq!(backend.uploads, 1);
    }

    #[test]
    fn supported_import_is_zero_copy() {
        let (frame, image) = frame_and_image();
        let mut backend = FakeBackend {
            supported: true,
            ..Default::default()
        };

        let bound = import_or_upload(&mut backend, &frame, Some(&image)).unwrap();
        assert!(bound.is_zero_copy());
        assert_eq!(backend.uploads, 0);
    }

    #[test]
    fn failed_import_is_not_fatal() {
        let (frame, image) = frame_and_image();
        let mut backend = FakeBackend {
            supported: true,
            import_fails: true,
            ..Default::default()
        };

        let bound = import_or_upload(&mut backend, &frame, Some(&image)).unwrap();
        assert!(matches!(
            bound,
            BoundTextures::Planes {
                reason: FallbackReason::ImportFailed(ref msg),
                ..
            } if msg.contains("EGL_BAD_MATCH")
        ));
        assert_eq!((backend.imports, backend.uploads), (1, 1));
    }

    #[test]
    fn no_buffer_skips_the_import() {
        let (frame, _) = frame_and_image();
        let mut backend = FakeBackend {
            supported: true,
            ..Default::default()
        };

        let bound = import_or_upload(&mut backend, &frame, None).unwrap();
        assert!(matches!(
            bound,
            BoundTextures::Planes {
                reason: FallbackReason::NoBuffer,
                ..
            }
        ));
        assert_eq!(backend.imports, 0);
    }

    #[test]
    fn failed_upload_is_fatal() {
        let (frame, _) = frame_and_image();
        let mut backend = FakeBackend {
            upload_fails: true,
            ..Default::default()
        };

        assert!(matches!(
            import_or_upload(&mut backend, &frame, None),
            Err(Nv12Error::Gl(_))
        ));
    }

    #[test]
    fn unusable_render_node_yields_no_buffer() {
        let frame = Nv12Frame::white(16, 16).unwrap();
        assert!(prepare_dmabuf("/nonexistent/renderD999", &frame).is_none());
    }

    #[test]
    fn teardown_errors_are_reported_not_propagated() {
        assert!(!warn_on_failure("EGL image", Ok(())));
        assert!(warn_on_failure(
            "unbound EGL image",
            Err(Nv12Error::Import("EGL_BAD_PARAMETER".into()))
        ));
    }
}
