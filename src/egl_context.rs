use std::ffi::{c_void, CStr};

use khronos_egl::{self as egl, ClientBuffer, Dynamic, Instance};

use crate::{
    types::{
        error::{Nv12Error, Result},
        frame::DmaBufImage,
    },
    window::{NativeWindowHandles, WaylandWindow},
};

type EglInstance = Instance<Dynamic<libloading::Library, egl::EGL1_5>>;

type PFNGLEGLIMAGETARGETTEXTURE2DOESPROC =
    unsafe extern "C" fn(target: gl::types::GLenum, image: *const c_void);

/// `GL_OES_EGL_image_external` texture target, not part of the desktop `gl` bindings.
pub const TEXTURE_EXTERNAL_OES: gl::types::GLenum = 0x8D65;

pub const DMA_BUF_IMPORT_EXT: &str = "EGL_EXT_image_dma_buf_import";
pub const DMA_BUF_IMPORT_MODIFIERS_EXT: &str = "EGL_EXT_image_dma_buf_import_modifiers";
const SURFACELESS_CONTEXT_EXT: &str = "EGL_KHR_surfaceless_context";

/// Token values from `EGL_EXT_image_dma_buf_import(_modifiers)`.
mod egl_ext {
    pub const LINUX_DMA_BUF: u32 = 0x3270;
    pub const LINUX_DRM_FOURCC: usize = 0x3271;
    pub const DMA_BUF_PLANE_FD: [usize; 3] = [0x3272, 0x3275, 0x3278];
    pub const DMA_BUF_PLANE_OFFSET: [usize; 3] = [0x3273, 0x3276, 0x3279];
    pub const DMA_BUF_PLANE_PITCH: [usize; 3] = [0x3274, 0x3277, 0x327A];
    pub const DMA_BUF_PLANE_MODIFIER_LO: [usize; 3] = [0x3443, 0x3445, 0x3447];
    pub const DMA_BUF_PLANE_MODIFIER_HI: [usize; 3] = [0x3444, 0x3446, 0x3448];
}

/// `DRM_FORMAT_MOD_INVALID`: the allocator picked an implicit layout.
const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// What the EGL context renders into.
pub enum SurfaceTarget<'a> {
    Headless { width: i32, height: i32 },
    Window(&'a WaylandWindow),
}

pub struct EglContext {
    egl_instance: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: Option<egl::Surface>, // Optional for surfaceless context
    _config: egl::Config,
    dmabuf_supported: bool,
    dmabuf_modifiers_supported: bool,
    image_target_texture: Option<PFNGLEGLIMAGETARGETTEXTURE2DOESPROC>,
    // Dropped after the EGL teardown in `Drop`.
    _window: Option<NativeWindowHandles>,
}

impl EglContext {
    pub fn new(target: SurfaceTarget<'_>) -> Result<Self> {
        let lib = unsafe { libloading::Library::new("libEGL.so.1") }
            .map_err(|e| Nv12Error::EglLoad(format!("unable to find libEGL.so.1: {e}")))?;
        let egl_instance = unsafe { egl::DynamicInstance::<egl::EGL1_5>::load_required_from(lib) }
            .map_err(|e| Nv12Error::EglLoad(format!("unable to load libEGL.so.1: {e}")))?;

        egl_instance.bind_api(egl::OPENGL_ES_API)?;

        let native_display = match target {
            SurfaceTarget::Headless { .. } => egl::DEFAULT_DISPLAY,
            SurfaceTarget::Window(window) => window.display_ptr(),
        };
        let display = unsafe { egl_instance.get_display(native_display) }
            .ok_or_else(|| Nv12Error::Init("eglGetDisplay failed".into()))?;

        let (major, minor) = egl_instance.initialize(display)?;
        log::debug!("EGL {major}.{minor} initialized");

        let surface_bit = match target {
            SurfaceTarget::Headless { .. } => egl::PBUFFER_BIT,
            SurfaceTarget::Window(_) => egl::WINDOW_BIT,
        };
        let mut attributes = vec![
            egl::SURFACE_TYPE,
            surface_bit,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES3_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
        ];
        if surface_bit == egl::WINDOW_BIT {
            attributes.extend([egl::ALPHA_SIZE, 8]);
        }
        attributes.push(egl::NONE);

        let config = match egl_instance.choose_first_config(display, &attributes)? {
            Some(config) => config,
            None if surface_bit == egl::PBUFFER_BIT => {
                log::warn!("pbuffer config not found, trying any GLES3 config");
                let fallback_attributes = [egl::RENDERABLE_TYPE, egl::OPENGL_ES3_BIT, egl::NONE];
                egl_instance
                    .choose_first_config(display, &fallback_attributes)?
                    .ok_or_else(|| {
                        Nv12Error::Init("unable to find an appropriate EGL configuration".into())
                    })?
            }
            None => {
                return Err(Nv12Error::Init(
                    "unable to find an EGL window configuration".into(),
                ))
            }
        };

        let context_attributes = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        let context = egl_instance.create_context(display, config, None, &context_attributes)?;

        let extensions = egl_instance.query_string(Some(display), egl::EXTENSIONS)?;
        let ext_str = extensions.to_string_lossy().into_owned();

        let surface = match target {
            SurfaceTarget::Window(window) => {
                let (width, height) = window.size();
                let surface = unsafe {
                    egl_instance.create_window_surface(
                        display,
                        config,
                        window.egl_window_ptr(),
                        None,
                    )
                }?;
                egl_instance.make_current(display, Some(surface), Some(surface), Some(context))?;
                log::debug!("Using window surface {width}x{height}");
                Some(surface)
            }
            SurfaceTarget::Headless { width, height } => {
                // Check supported surface types for this config
                let surface_type =
                    egl_instance.get_config_attrib(display, config, egl::SURFACE_TYPE)?;

                if (surface_type & egl::PBUFFER_BIT) != 0 {
                    log::debug!("Using pbuffer surface {width}x{height}");
                    let surface_attributes = [egl::WIDTH, width, egl::HEIGHT, height, egl::NONE];
                    let surface =
                        egl_instance.create_pbuffer_surface(display, config, &surface_attributes)?;
                    egl_instance.make_current(
                        display,
                        Some(surface),
                        Some(surface),
                        Some(context),
                    )?;
                    Some(surface)
                } else if extension_list_contains(&ext_str, SURFACELESS_CONTEXT_EXT) {
                    log::debug!("Using surfaceless context");
                    egl_instance.make_current(display, None, None, Some(context))?;
                    None
                } else {
                    return Err(Nv12Error::Init("No suitable surface type available".into()));
                }
            }
        };

        gl::load_with(|symbol| {
            egl_instance
                .get_proc_address(symbol)
                .map_or(std::ptr::null(), |f| f as *const c_void)
        });

        let image_target_texture = egl_instance
            .get_proc_address("glEGLImageTargetTexture2DOES")
            .map(|f| unsafe {
                std::mem::transmute::<extern "system" fn(), PFNGLEGLIMAGETARGETTEXTURE2DOESPROC>(f)
            });
        if image_target_texture.is_none() {
            log::warn!("glEGLImageTargetTexture2DOES not available");
        }

        let (dmabuf_supported, dmabuf_modifiers_supported) = check_dmabuf_support(&ext_str);
        if dmabuf_supported {
            log::info!("{DMA_BUF_IMPORT_EXT} available");
        } else {
            log::warn!("{DMA_BUF_IMPORT_EXT} NOT available, dma-buf frames will be uploaded");
        }

        log::info!(
            "GL renderer: {} ({})",
            gl_string(gl::RENDERER),
            gl_string(gl::VERSION)
        );

        Ok(Self {
            egl_instance,
            display,
            _config: config,
            context,
            surface,
            dmabuf_supported,
            dmabuf_modifiers_supported,
            image_target_texture,
            _window: match target {
                SurfaceTarget::Window(window) => Some(window.native_handles()),
                SurfaceTarget::Headless { .. } => None,
            },
        })
    }

    /// True when both the EGL extension and the GL entry point needed to
    /// sample a dma-buf are present.
    pub fn supports_dmabuf_import(&self) -> bool {
        self.dmabuf_supported && self.image_target_texture.is_some()
    }

    pub fn create_image_from_dmabuf(&self, image: &DmaBufImage) -> Result<egl::Image> {
        if !self.dmabuf_supported {
            return Err(Nv12Error::Import("DMA-BUF import not supported".into()));
        }

        let attributes = dmabuf_image_attributes(image, self.dmabuf_modifiers_supported);
        log::trace!("eglCreateImage attributes: {attributes:x?}");

        self.egl_instance
            .create_image(
                self.display,
                unsafe { egl::Context::from_ptr(egl::NO_CONTEXT) },
                egl_ext::LINUX_DMA_BUF,
                unsafe { ClientBuffer::from_ptr(std::ptr::null_mut()) },
                &attributes,
            )
            .map_err(|e| Nv12Error::Import(format!("Failed to create EGL image from DMA-BUF: {e:?}")))
    }

    /// Creates a texture on `target` backed by `image`.
    pub fn bind_image_to_texture(
        &self,
        image: egl::Image,
        target: gl::types::GLenum,
    ) -> Result<u32> {
        let Some(image_target_texture) = self.image_target_texture else {
            return Err(Nv12Error::Import(
                "glEGLImageTargetTexture2DOES not available".into(),
            ));
        };

        unsafe {
            let mut texture = 0;
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(target, texture);
            gl::TexParameteri(target, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(target, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(target, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(target, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);

            image_target_texture(target, image.as_ptr());

            let gl_error = gl::GetError();
            gl::BindTexture(target, 0);
            if gl_error != gl::NO_ERROR {
                gl::DeleteTextures(1, &texture);
                return Err(Nv12Error::Import(format!(
                    "glEGLImageTargetTexture2DOES failed: 0x{gl_error:x}"
                )));
            }

            log::trace!("Bound EGL image to texture {texture} (target 0x{target:x})");
            Ok(texture)
        }
    }

    pub fn destroy_image(&self, image: egl::Image) -> Result<()> {
        self.egl_instance
            .destroy_image(self.display, image)
            .map_err(|e| format!("Failed to destroy EGL image: {e:?}").into())
    }

    pub fn delete_texture(&self, texture_id: u32) {
        unsafe {
            gl::DeleteTextures(1, &texture_id);
        }
    }

    pub fn swap_buffers(&self) -> Result<()> {
        if let Some(surface) = self.surface {
            self.egl_instance.swap_buffers(self.display, surface)?;
        }
        Ok(())
    }

    /// Binds this context (and its surface, if any) to the calling thread.
    pub fn make_current(&self) -> Result<()> {
        self.egl_instance.make_current(
            self.display,
            self.surface,
            self.surface,
            Some(self.context),
        )?;
        Ok(())
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self
            .egl_instance
            .make_current(self.display, None, None, None);

        if let Some(surface) = self.surface {
            let _ = self.egl_instance.destroy_surface(self.display, surface);
        }

        let _ = self
            .egl_instance
            .destroy_context(self.display, self.context);
        let _ = self.egl_instance.terminate(self.display);
    }
}

/// Returns `(dma-buf import, dma-buf import with modifiers)` support.
fn check_dmabuf_support(extensions: &str) -> (bool, bool) {
    (
        extension_list_contains(extensions, DMA_BUF_IMPORT_EXT),
        extension_list_contains(extensions, DMA_BUF_IMPORT_MODIFIERS_EXT),
    )
}

/// Whole-token match against a space separated extension string.
pub fn extension_list_contains(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|ext| ext == name)
}

/// Attribute list for `eglCreateImage(EGL_LINUX_DMA_BUF_EXT)`.
///
/// Modifier pairs are only emitted when the driver understands them and the
/// allocator reported an explicit modifier. At most three planes are described.
pub fn dmabuf_image_attributes(image: &DmaBufImage, with_modifiers: bool) -> Vec<egl::Attrib> {
    let mut attributes = vec![
        egl_ext::LINUX_DRM_FOURCC,
        image.fourcc as u32 as usize,
        egl::WIDTH as usize,
        image.width as usize,
        egl::HEIGHT as usize,
        image.height as usize,
    ];

    let modifier = image
        .modifier
        .filter(|&m| with_modifiers && m != DRM_FORMAT_MOD_INVALID);

    for (i, plane) in image.planes.iter().take(3).enumerate() {
        attributes.extend([
            egl_ext::DMA_BUF_PLANE_FD[i],
            plane.fd as usize,
            egl_ext::DMA_BUF_PLANE_OFFSET[i],
            plane.offset as usize,
            egl_ext::DMA_BUF_PLANE_PITCH[i],
            plane.stride as usize,
        ]);

        if let Some(modifier) = modifier {
            attributes.extend([
                egl_ext::DMA_BUF_PLANE_MODIFIER_LO[i],
                (modifier & 0xFFFFFFFF) as usize,
                egl_ext::DMA_BUF_PLANE_MODIFIER_HI[i],
                (modifier >> 32) as usize,
            ]);
        }
    }

    attributes.push(egl::NONE as usize);
    attributes
}

fn gl_string(name: gl::types::GLenum) -> String {
    unsafe {
        let ptr = gl::GetString(name);
        if ptr.is_null() {
            "unknown".to_string()
        } else {
            CStr::from_ptr(ptr as *const std::ffi::c_char)
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::frame::FrameLayout;

    #[test]
    fn extension_probe_matches_whole_tokens() {
        let list = "EGL_KHR_image_base EGL_EXT_image_dma_buf_import_modifiers EGL_KHR_surfaceless_context";
        assert!(!extension_list_contains(list, DMA_BUF_IMPORT_EXT));
        assert!(extension_list_contains(list, DMA_BUF_IMPORT_MODIFIERS_EXT));
        assert_eq!(check_dmabuf_support(list), (false, true));
        assert_eq!(
            check_dmabuf_support("EGL_EXT_image_dma_buf_import"),
            (true, false)
        );
    }

    #[test]
    fn attributes_describe_both_nv12_planes() {
        let image = DmaBufImage::nv12(9, 640, 480, &FrameLayout::packed(640, 480)).unwrap();
        let attrs = dmabuf_image_attributes(&image, false);

        assert_eq!(attrs.len(), 6 + 2 * 6 + 1);
        assert_eq!(&attrs[..2], &[0x3271, 0x3231564E]);
        assert_eq!(&attrs[6..12], &[0x3272, 9, 0x3273, 0, 0x3274, 640]);
        assert_eq!(&attrs[12..18], &[0x3275, 9, 0x3276, 640 * 480, 0x3277, 640]);
        assert_eq!(*attrs.last().unwrap(), egl::NONE as usize);
    }

    #[test]
    fn modifiers_need_support_and_an_explicit_value() {
        let mut image = DmaBufImage::nv12(3, 64, 64, &FrameLayout::packed(64, 64)).unwrap();
        image.modifier = Some(0x0100_0000_0000_0001);

        let attrs = dmabuf_image_attributes(&image, true);
        assert_eq!(attrs.len(), 6 + 2 * 10 + 1);
        assert_eq!(&attrs[12..16], &[0x3443, 1, 0x3444, 0x0100_0000]);

        assert_eq!(dmabuf_image_attributes(&image, false).len(), 6 + 2 * 6 + 1);

        image.modifier = Some(DRM_FORMAT_MOD_INVALID);
        assert_eq!(dmabuf_image_attributes(&image, true).len(), 6 + 2 * 6 + 1);
    }
}
