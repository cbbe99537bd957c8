use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    convert::save_rgb_png,
    egl_context::EglContext,
    import::BoundTextures,
    renderer::Renderer,
    types::{
        config::log_level_from_env,
        error::{Nv12Error, Result},
    },
    window::WaylandWindow,
};

/// Sends log output to stderr at the level named by `NV12_LOG` (default `info`).
pub fn init_logging() {
    simple_logging::log_to_stderr(log_level_from_env());
}

/// Returns a flag that is raised once Ctrl-C is pressed.
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        log::info!("Interrupted, shutting down");
        handler_flag.store(true, Ordering::Release);
    })
    .map_err(|e| Nv12Error::Init(format!("Failed to install Ctrl-C handler: {e}")))?;
    Ok(interrupted)
}

/// Writes `rgb` raw to `path` and as a PNG preview beside it.
/// A failed preview is only logged.
pub fn save_rgb_outputs(path: &Path, width: u32, height: u32, rgb: Vec<u8>) -> Result<()> {
    std::fs::write(path, &rgb)?;
    log::info!("Wrote {} ({} bytes RGB24)", path.display(), rgb.len());

    let preview = preview_path(path);
    match save_rgb_png(&preview, width, height, rgb) {
        Ok(()) => log::info!("Wrote preview {}", preview.display()),
        Err(e) => log::warn!("Could not write {}: {e}", preview.display()),
    }
    Ok(())
}

/// Redraws `textures` into the window until it is closed or Ctrl-C is pressed.
pub fn present_until_closed(
    window: &mut WaylandWindow,
    egl: &EglContext,
    renderer: &Renderer,
    textures: &BoundTextures,
) -> Result<()> {
    let interrupted = interrupt_flag()?;
    egl.make_current()?;
    log::info!("Showing frame, close the window or press Ctrl-C to exit");

    while window.dispatch()? && !interrupted.load(Ordering::Acquire) {
        let (width, height) = window.size();
        renderer.draw(textures, width, height)?;
        egl.swap_buffers()?;
    }
    Ok(())
}

fn preview_path(path: &Path) -> PathBuf {
    path.with_extension("png")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_sits_next_to_the_raw_output() {
        assert_eq!(preview_path(Path::new("output.rgb")), PathBuf::from("output.png"));
        assert_eq!(
            preview_path(Path::new("/tmp/frames/out")),
            PathBuf::from("/tmp/frames/out.png")
        );
    }

    #[test]
    fn raw_and_preview_are_written() {
        let dir = std::env::temp_dir().join(format!("nv12-out-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("output.rgb");

        save_rgb_outputs(&raw, 4, 2, vec![255; 4 * 2 * 3]).unwrap();
        assert_eq!(std::fs::read(&raw).unwrap().len(), 24);
        let png = image::open(dir.join("output.png")).unwrap().to_rgb8();
        assert_eq!(png.dimensions(), (4, 2));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
