use nv12_gpu::{
    types::{config::ScaleConfig, error::Result, frame::Nv12Frame},
    utils::init_logging,
    vulkan::VulkanScaler,
};

fn main() -> Result<()> {
    init_logging();
    let config = ScaleConfig::from_args(std::env::args().skip(1))?;

    log::info!(
        "Scaling {} from {}x{} to {}x{}",
        config.input.display(),
        config.in_width,
        config.in_height,
        config.out_width,
        config.out_height
    );

    let frame = Nv12Frame::read_from(&config.input, config.in_width, config.in_height)?;
    let scaler = VulkanScaler::new(&config.y_shader, &config.uv_shader)?;
    let scaled = scaler.scale(&frame, config.out_width, config.out_height)?;
    scaled.write_to(&config.output)?;

    log::info!(
        "Wrote scaled NV12 to {} ({}x{})",
        config.output.display(),
        scaled.width(),
        scaled.height()
    );
    Ok(())
}
