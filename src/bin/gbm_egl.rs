use nv12_gpu::{
    egl_context::{EglContext, SurfaceTarget},
    import::{import_or_upload, prepare_dmabuf, EglImporter, ImportBackend},
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

    log::info!("NV12 GBM -> EGL import");
    log::info!("======================");
    log::info!(
        "Input {} ({}x{}), render node {}",
        config.input.display(),
        config.width,
        config.height,
        config.render_node.display()
    );

    let frame = Nv12Frame::read_from(&config.input, config.width, config.height)?;

    let mut window = match DisplayMode::from_env() {
        DisplayMode::Window => Some(WaylandWindow::new("NV12 GBM EGL", width, height)?),
        DisplayMode::Headless => {
            log::info!("WAYLAND_DISPLAY not set, rendering offscreen");
            None
        }
    };
    let egl = EglContext::new(match &window {
        Some(window) => SurfaceTarget::Window(window),
        None => SurfaceTarget::Headless { width, height },
    })?;

    let dmabuf = prepare_dmabuf(&config.render_node, &frame);
    let image = dmabuf.as_ref().map(|prepared| prepared.image());

    let mut importer = EglImporter::new(&egl);
    let textures = import_or_upload(&mut importer, &frame, image.as_ref())?;

    let renderer = Renderer::new()?;
    renderer.draw(&textures, width, height)?;

    let rgb = renderer.read_rgb(width, height)?;
    save_rgb_outputs(&config.output, config.width, config.height, rgb)?;

    if let Some(window) = window.as_mut() {
        egl.swap_buffers()?;
        present_until_closed(window, &egl, &renderer, &textures)?;
    }

    importer.release(&textures);
    log::info!(
        "Done ({})",
        if textures.is_zero_copy() {
            "zero-copy import"
        } else {
            "uploaded"
        }
    );
    Ok(())
}
