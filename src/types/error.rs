use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Nv12Error {
    /// Egl Errors,
    Egl(khronos_egl::Error),
    /// Failure loading libEGL
    EglLoad(String),
    /// OpenGL ES errors
    Gl(String),
    /// Vulkan errors
    Vulkan(ash::vk::Result),
    /// GBM allocation and DRM export errors
    Gbm(String),
    /// I/O errors
    Io(io::Error),
    /// Image encoding errors
    Image(image::ImageError),
    /// Initialization errors
    Init(String),
    /// Configuration errors
    Config(String),
    /// Dma-buf import errors
    Import(String),
    /// Validation errors
    Validation(String),
    /// Other errors
    Other(String),
}

impl fmt::Display for Nv12Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nv12Error::Egl(err) => write!(f, "Egl Error: {err}"),
            Nv12Error::EglLoad(msg) => write!(f, "Unable to load EGL: {msg}"),
            Nv12Error::Gl(msg) => write!(f, "GL error: {msg}"),
            Nv12Error::Vulkan(res) => write!(f, "Vulkan error: {res}"),
            Nv12Error::Gbm(msg) => write!(f, "GBM error: {msg}"),
            Nv12Error::Io(err) => write!(f, "I/O error: {err}"),
            Nv12Error::Image(err) => write!(f, "Image error: {err}"),
            Nv12Error::Init(msg) => write!(f, "Initialization error: {msg}"),
            Nv12Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Nv12Error::Import(msg) => write!(f, "Import error: {msg}"),
            Nv12Error::Validation(msg) => write!(f, "Validation error: {msg}"),
            Nv12Error::Other(msg) => write!(f, "Error: {msg}"),
        }
    }
}

impl Error for Nv12Error {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Nv12Error::Egl(err) => Some(err),
            Nv12Error::Vulkan(err) => Some(err),
            Nv12Error::Io(err) => Some(err),
            Nv12Error::Image(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Nv12Error {
    fn from(err: io::Error) -> Self {
        Nv12Error::Io(err)
    }
}

impl From<khronos_egl::Error> for Nv12Error {
    fn from(err: khronos_egl::Error) -> Self {
        Nv12Error::Egl(err)
    }
}

impl From<ash::vk::Result> for Nv12Error {
    fn from(err: ash::vk::Result) -> Self {
        Nv12Error::Vulkan(err)
    }
}

impl From<ash::LoadingError> for Nv12Error {
    fn from(err: ash::LoadingError) -> Self {
        Nv12Error::Init(format!("Unable to load the Vulkan loader: {err}"))
    }
}

impl From<image::ImageError> for Nv12Error {
    fn from(err: image::ImageError) -> Self {
        Nv12Error::Image(err)
    }
}

impl From<String> for Nv12Error {
    fn from(err: String) -> Self {
        Nv12Error::Other(err)
    }
}

impl From<&str> for Nv12Error {
    fn from(err: &str) -> Self {
        Nv12Error::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Nv12Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_source() {
        let err: Nv12Error = io::Error::new(io::ErrorKind::NotFound, "frame_nv12.raw").into();
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn strings_become_other() {
        let err: Nv12Error = "boom".into();
        assert!(matches!(err, Nv12Error::Other(ref m) if m == "boom"));
    }
}
