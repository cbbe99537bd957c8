use std::path::Path;

use nv12_gpu::{
    convert::{nv12_to_rgb, Matrix},
    types::{
        config::{parse_dimension, DEFAULT_RGB_OUTPUT},
        error::{Nv12Error, Result},
        frame::Nv12Frame,
    },
    utils::{init_logging, save_rgb_outputs},
};

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [input, width, height] = args.as_slice() else {
        return Err(Nv12Error::Config(
            "usage: nv12-to-rgb <input.yuv> <width> <height>".into(),
        ));
    };
    let width = parse_dimension("width", width)?;
    let height = parse_dimension("height", height)?;

    let frame = Nv12Frame::read_from(input, width, height)?;
    let rgb = nv12_to_rgb(&frame, Matrix::Bt601Limited);

    save_rgb_outputs(Path::new(DEFAULT_RGB_OUTPUT), width, height, rgb)?;
    log::info!("Converted {input} ({width}x{height}) to RGB");
    Ok(())
}
