use nv12_gpu::{
    egl_context::{EglContext, SurfaceTarget},
    import::{import_or_upload, EglImporter, ImportBackend},
    renderer::Renderer,
    types::{
        config::{DemoConfig, DisplayMode},
        error::Result,
        frame::Nv12Frame,
    },
    utils::{init_logging, present_until_closed, save_rgb_outputs},
    window::WaylandWindow,
};

fn main() -> Result<()> {
    init_logging();
    let config = DemoConfig::from_args(std::env::args().skip(1))?;
    let (width, height) = (config.width as i32, config.height as i32);

    log::info!("NV12 GLES viewer");
    log::info!("================");
    log::info!(
        "Uploading {} ({}x{}) as R8 + RG8 textures",
        config.input.display(),
        config.width,
        config.height
    );

    let frame = Nv12Frame::read_from(&config.input, config.width, config.height)?;

    let mut window = match DisplayMode::from_env() {
        DisplayMode::Window => Some(WaylandWindow::new("NV12 GLES viewer", width, height)?),
        DisplayMode::Headless => {
            log::info!("WAYLAND_DISPLAY not set, rendering offscreen");
            None
        }
    };
    let egl = EglContext::new(match &window {
        Some(window) => SurfaceTarget::Window(window),
        None => SurfaceTarget::Headless { width, height },
    })?;

    let mut importer = EglImporter::new(&egl);
    let textures = import_or_upload(&mut importer, &frame, None)?;
    let renderer = Renderer::new()?;
    renderer.draw(&textures, width, height)?;

    match window.as_mut() {
        Some(window) => {
            egl.swap_buffers()?;
            present_until_closed(window, &egl, &renderer, &textures)?;
        }
        None => {
            let rgb = renderer.read_rgb(width, height)?;
            save_rgb_outputs(&config.output, config.width, config.height, rgb)?;
        }
    }

    importer.release(&textures);
    Ok(())
}
