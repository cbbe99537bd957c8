use std::os::fd::{AsFd, AsRawFd};

use nv12_gpu::{
    dmabuf::{memfd_buffer, MappedDmaBuf},
    egl_context::{EglContext, SurfaceTarget},
    import::{import_or_upload, EglImporter, ImportBackend},
    renderer::Renderer,
    types::{
        config::{parse_dimension, DEFAULT_HEIGHT, DEFAULT_WIDTH},
        error::{Nv12Error, Result},
        frame::{DmaBufImage, FrameLayout, Nv12Frame},
    },
    utils::init_logging,
};

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (width, height) = match args.as_slice() {
        [] => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        [w, h] => (parse_dimension("width", w)?, parse_dimension("height", h)?),
        _ => {
            return Err(Nv12Error::Config(
                "usage: nv12-dmabuf-test [width height]".into(),
            ))
        }
    };

    let egl = EglContext::new(SurfaceTarget::Headless {
        width: width as i32,
        height: height as i32,
    })?;
    log::info!("EGL/GLES initialized");

    // A memfd stands in for a real dma-buf: the import only succeeds on
    // drivers that accept any mappable fd.
    let frame = Nv12Frame::checkerboard(width, height)?;
    let layout = FrameLayout::packed(width, height);
    let fd = memfd_buffer("nv12-fake-dmabuf", frame.byte_size())?;
    {
        let mut map = MappedDmaBuf::map(fd.as_fd(), frame.byte_size())?;
        frame.store_into(map.as_mut_slice(), &layout)?;
        map.flush()?;
    }
    log::info!("Fake NV12 dma-buf created (fd {})", fd.as_raw_fd());

    let image = DmaBufImage::nv12(fd.as_raw_fd(), width, height, &layout)?;
    let mut importer = EglImporter::new(&egl);
    let textures = import_or_upload(&mut importer, &frame, Some(&image))?;

    let renderer = Renderer::new()?;
    renderer.draw(&textures, width as i32, height as i32)?;
    let rgb = renderer.read_rgb(width as i32, height as i32)?;

    let center = ((height / 2) as usize * width as usize + (width / 2) as usize) * 3;
    log::info!(
        "Rendered, center pixel RGB {:?} via {}",
        &rgb[center..center + 3],
        if textures.is_zero_copy() {
            "external texture"
        } else {
            "uploaded planes"
        }
    );

    importer.release(&textures);
    Ok(())
}
