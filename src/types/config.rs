use std::path::PathBuf;

use crate::types::error::{Nv12Error, Result};

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_INPUT: &str = "frame_nv12.raw";
pub const DEFAULT_RGB_OUTPUT: &str = "output.rgb";
pub const DEFAULT_WHITE_OUTPUT: &str = "test_nv12_white.yuv";
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

pub const RENDER_NODE_ENV: &str = "NV12_RENDER_NODE";
pub const LOG_LEVEL_ENV: &str = "NV12_LOG";

/// Where a program presents what it rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Wayland toplevel window.
    Window,
    /// Offscreen pbuffer or surfaceless context.
    Headless,
}

impl DisplayMode {
    pub fn from_env() -> Self {
        Self::from_wayland_display(std::env::var_os("WAYLAND_DISPLAY").is_some())
    }

    fn from_wayland_display(present: bool) -> Self {
        if present {
            Self::Window
        } else {
            Self::Headless
        }
    }
}

/// Settings shared by the single frame demos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    pub input: PathBuf,
    pub width: u32,
    pub height: u32,
    pub output: PathBuf,
    pub render_node: PathBuf,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            output: PathBuf::from(DEFAULT_RGB_OUTPUT),
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }
}

impl DemoConfig {
    /// Parses `[input] [width height]` and applies the environment overrides.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        let mut config = Self::default();

        match args.as_slice() {
            [] => {}
            [input] => config.input = PathBuf::from(input),
            [input, w, h] => {
                config.input = PathBuf::from(input);
                config.width = parse_dimension("width", w)?;
                config.height = parse_dimension("height", h)?;
            }
            _ => {
                return Err(Nv12Error::Config(format!(
                    "expected [input] [width height], got {} arguments",
                    args.len()
                )))
            }
        }

        if let Some(node) = std::env::var_os(RENDER_NODE_ENV) {
            config.render_node = PathBuf::from(node);
        }

        Ok(config)
    }
}

/// Settings for the Vulkan compute scaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleConfig {
    pub input: PathBuf,
    pub in_width: u32,
    pub in_height: u32,
    pub out_width: u32,
    pub out_height: u32,
    pub y_shader: PathBuf,
    pub uv_shader: PathBuf,
    pub output: PathBuf,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("input_nv12.raw"),
            in_width: DEFAULT_WIDTH,
            in_height: DEFAULT_HEIGHT,
            out_width: DEFAULT_WIDTH / 2,
            out_height: DEFAULT_HEIGHT / 2,
            y_shader: PathBuf::from("scale_y.spv"),
            uv_shader: PathBuf::from("scale_uv.spv"),
            output: PathBuf::from("scaled_nv12.raw"),
        }
    }
}

impl ScaleConfig {
    /// Parses `[input] [in_w in_h] [out_w out_h] [spv_y] [spv_uv] [output]`.
    /// Every group is optional but positional, like the arguments of the C demo.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        let mut config = Self::default();

        if let Some(input) = args.first() {
            config.input = PathBuf::from(input);
        }
        if args.len() >= 3 {
            config.in_width = parse_dimension("input width", &args[1])?;
            config.in_height = parse_dimension("input height", &args[2])?;
        }
        if args.len() >= 5 {
            config.out_width = parse_dimension("output width", &args[3])?;
            config.out_height = parse_dimension("output height", &args[4])?;
        }
        if let Some(spv) = args.get(5) {
            config.y_shader = PathBuf::from(spv);
        }
        if let Some(spv) = args.get(6) {
            config.uv_shader = PathBuf::from(spv);
        }
        if let Some(output) = args.get(7) {
            config.output = PathBuf::from(output);
        }
        if args.len() > 8 {
            return Err(Nv12Error::Config(format!(
                "too many arguments ({}), at most 8 are accepted",
                args.len()
            )));
        }

        for (name, value) in [
            ("input width", config.in_width),
            ("input height", config.in_height),
            ("output width", config.out_width),
            ("output height", config.out_height),
        ] {
            if value % 2 != 0 {
                return Err(Nv12Error::Config(format!(
                    "{name} must be even for NV12, got {value}"
                )));
            }
        }

        Ok(config)
    }
}

pub fn parse_dimension(name: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(v) if v >= 2 => Ok(v),
        _ => Err(Nv12Error::Config(format!(
            "{name} must be an integer >= 2, got {value:?}"
        ))),
    }
}

pub fn log_level_from_env() -> log::LevelFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(log::LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn demo_defaults_follow_the_c_programs() {
        let config = DemoConfig::from_args(Vec::new()).unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert_eq!(config.input, PathBuf::from("frame_nv12.raw"));
    }

    #[test]
    fn demo_positional_arguments() {
        let config = DemoConfig::from_args(args(&["clip.yuv", "320", "240"])).unwrap();
        assert_eq!(config.input, PathBuf::from("clip.yuv"));
        assert_eq!((config.width, config.height), (320, 240));

        assert!(DemoConfig::from_args(args(&["clip.yuv", "320"])).is_err());
        assert!(DemoConfig::from_args(args(&["clip.yuv", "abc", "240"])).is_err());
    }

    #[test]
    fn scale_arguments_are_grouped() {
        let config = ScaleConfig::from_args(args(&["in.raw", "1280", "720"])).unwrap();
        assert_eq!((config.in_width, config.in_height), (1280, 720));
        assert_eq!((config.out_width, config.out_height), (320, 240));

        let config = ScaleConfig::from_args(args(&[
            "in.raw", "640", "480", "160", "120", "y.spv", "uv.spv", "out.raw",
        ]))
        .unwrap();
        assert_eq!(config.y_shader, PathBuf::from("y.spv"));
        assert_eq!(config.output, PathBuf::from("out.raw"));
    }

    #[test]
    fn scale_rejects_odd_sizes() {
        assert!(ScaleConfig::from_args(args(&["in.raw", "641", "480"])).is_err());
        assert!(ScaleConfig::from_args(args(&["in.raw", "640", "480", "161", "120"])).is_err());
    }

    #[test]
    fn display_mode_follows_wayland_display() {
        assert_eq!(DisplayMode::from_wayland_display(true), DisplayMode::Window);
        assert_eq!(DisplayMode::from_wayland_display(false), DisplayMode::Headless);
    }
}
