use std::path::PathBuf;

use nv12_gpu::{
    types::{
        config::{parse_dimension, DEFAULT_HEIGHT, DEFAULT_WHITE_OUTPUT, DEFAULT_WIDTH},
        error::{Nv12Error, Result},
        frame::Nv12Frame,
    },
    utils::init_logging,
};

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (output, width, height) = match args.as_slice() {
        [] => (PathBuf::from(DEFAULT_WHITE_OUTPUT), DEFAULT_WIDTH, DEFAULT_HEIGHT),
        [out] => (PathBuf::from(out), DEFAULT_WIDTH, DEFAULT_HEIGHT),
        [out, w, h] => (
            PathBuf::from(out),
            parse_dimension("width", w)?,
            parse_dimension("height", h)?,
        ),
        _ => {
            return Err(Nv12Error::Config(
                "usage: nv12-gen-white [output] [width height]".into(),
            ))
        }
    };

    let frame = Nv12Frame::white(width, height)?;
    frame.write_to(&output)?;

    log::info!(
        "Generated {width}x{height} white NV12 frame: {} ({} bytes)",
        output.display(),
        frame.byte_size()
    );
    Ok(())
}
