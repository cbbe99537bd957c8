use std::{
    fs::File,
    io::{Read, Write},
    os::fd::RawFd,
    path::Path,
};

use drm_fourcc::DrmFourcc;

use crate::types::error::{Nv12Error, Result};

/// Size in bytes of an NV12 frame: a full resolution luma plane followed by a
/// half resolution plane of interleaved U,V pairs.
pub fn byte_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width < 2 || height < 2 || width % 2 != 0 || height % 2 != 0 {
        return Err(Nv12Error::Validation(format!(
            "NV12 dimensions must be even and at least 2x2, got {width}x{height}"
        )));
    }
    Ok(())
}

/// A single NV12 frame held in CPU memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nv12Frame {
    width: u32,
    height: u32,
    y: Vec<u8>,
    uv: Vec<u8>,
}

impl Nv12Frame {
    pub fn from_planes(width: u32, height: u32, y: Vec<u8>, uv: Vec<u8>) -> Result<Self> {
        check_dimensions(width, height)?;
        let y_len = width as usize * height as usize;
        if y.len() != y_len || uv.len() != y_len / 2 {
            return Err(Nv12Error::Validation(format!(
                "plane sizes {}/{} do not match a {width}x{height} frame",
                y.len(),
                uv.len()
            )));
        }
        Ok(Self {
            width,
            height,
            y,
            uv,
        })
    }

    /// Frame with every luma sample set to `y` and every chroma pair set to `(u, v)`.
    pub fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Result<Self> {
        check_dimensions(width, height)?;
        let y_len = width as usize * height as usize;
        let uv = [u, v].repeat(y_len / 4);
        Self::from_planes(width, height, vec![y; y_len], uv)
    }

    pub fn white(width: u32, height: u32) -> Result<Self> {
        Self::solid(width, height, 255, 128, 128)
    }

    /// 32 pixel luma checkerboard over a constant chroma.
    pub fn checkerboard(width: u32, height: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        let (w, h) = (width as usize, height as usize);
        let mut y = vec![0u8; w * h];
        for row in 0..h {
            for col in 0..w {
                y[row * w + col] = if (col / 32 + row / 32) % 2 == 1 { 200 } else { 50 };
            }
        }
        let uv = [90u8, 240].repeat(w * h / 4);
        Self::from_planes(width, height, y, uv)
    }

    pub fn from_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        check_dimensions(width, height)?;
        let expected = byte_size(width, height);
        if bytes.len() != expected {
            return Err(Nv12Error::Validation(format!(
                "expected {expected} bytes for a {width}x{height} NV12 frame, got {}",
                bytes.len()
            )));
        }
        let (y, uv) = bytes.split_at(width as usize * height as usize);
        Self::from_planes(width, height, y.to_vec(), uv.to_vec())
    }

    /// Reads the first frame of a raw NV12 file. Trailing bytes are ignored,
    /// a short file is an error.
    pub fn read_from<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            Nv12Error::Init(format!("Failed to open {}: {e}", path.display()))
        })?;
        let mut bytes = vec![0u8; byte_size(width, height)];
        file.read_exact(&mut bytes).map_err(|e| {
            Nv12Error::Validation(format!(
                "{} is too short for a {width}x{height} NV12 frame: {e}",
                path.display()
            ))
        })?;
        Self::from_bytes(width, height, &bytes)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.y)?;
        file.write_all(&self.uv)?;
        file.flush()?;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.y
    }

    pub fn uv_plane(&self) -> &[u8] {
        &self.uv
    }

    pub fn byte_size(&self) -> usize {
        byte_size(self.width, self.height)
    }

    /// Copies both planes into `dst` at the offsets and row strides of `layout`.
    pub fn store_into(&self, dst: &mut [u8], layout: &FrameLayout) -> Result<()> {
        layout.validate(self.width, self.height)?;
        if dst.len() < layout.total_size(self.height) {
            return Err(Nv12Error::Validation(format!(
                "destination holds {} bytes, layout needs {}",
                dst.len(),
                layout.total_size(self.height)
            )));
        }

        let row = self.width as usize;
        for (r, src) in self.y.chunks_exact(row).enumerate() {
            let start = layout.y.offset + r * layout.y.stride;
            dst[start..start + row].copy_from_slice(src);
        }
        // Interleaved UV rows are `width` bytes long: width/2 pairs.
        for (r, src) in self.uv.chunks_exact(row).enumerate() {
            let start = layout.uv.offset + r * layout.uv.stride;
            dst[start..start + row].copy_from_slice(src);
        }
        Ok(())
    }

    /// Inverse of [`Self::store_into`].
    pub fn load_from(src: &[u8], width: u32, height: u32, layout: &FrameLayout) -> Result<Self> {
        check_dimensions(width, height)?;
        layout.validate(width, height)?;
        if src.len() < layout.total_size(height) {
            return Err(Nv12Error::Validation(format!(
                "source holds {} bytes, layout needs {}",
                src.len(),
                layout.total_size(height)
            )));
        }

        let row = width as usize;
        let mut y = Vec::with_capacity(row * height as usize);
        for r in 0..height as usize {
            let start = layout.y.offset + r * layout.y.stride;
            y.extend_from_slice(&src[start..start + row]);
        }
        let mut uv = Vec::with_capacity(row * height as usize / 2);
        for r in 0..height as usize / 2 {
            let start = layout.uv.offset + r * layout.uv.stride;
            uv.extend_from_slice(&src[start..start + row]);
        }
        Self::from_planes(width, height, y, uv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
}

/// Where the two NV12 planes live inside a single buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub y: PlaneLayout,
    pub uv: PlaneLayout,
}

impl FrameLayout {
    /// Tightly packed layout, as found in a raw `.yuv` file.
    pub fn packed(width: u32, height: u32) -> Self {
        let w = width as usize;
        Self {
            y: PlaneLayout {
                offset: 0,
                stride: w,
            },
            uv: PlaneLayout {
                offset: w * height as usize,
                stride: w,
            },
        }
    }

    /// Bytes needed to hold both planes, measured from the start of the buffer.
    pub fn total_size(&self, height: u32) -> usize {
        let y_end = self.y.offset + self.y.stride * height as usize;
        let uv_end = self.uv.offset + self.uv.stride * (height as usize / 2);
        y_end.max(uv_end)
    }

    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        let row = width as usize;
        if self.y.stride < row || self.uv.stride < row {
            return Err(Nv12Error::Validation(format!(
                "strides {}/{} are shorter than the {row} byte rows",
                self.y.stride, self.uv.stride
            )));
        }
        let y_end = self.y.offset + self.y.stride * height as usize;
        if self.uv.offset < y_end {
            return Err(Nv12Error::Validation(format!(
                "chroma plane at offset {} overlaps the luma plane ending at {y_end}",
                self.uv.offset
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// Everything EGL needs to turn a dma-buf into an image.
#[derive(Debug, Clone)]
pub struct DmaBufImage {
    pub fourcc: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<DmaBufPlane>,
    /// `None` when the allocator did not report an explicit modifier.
    pub modifier: Option<u64>,
}

impl DmaBufImage {
    /// Describes an NV12 frame whose two planes share one descriptor.
    /// Offsets and strides must fit the 32 bit EGL attributes.
    pub fn nv12(fd: RawFd, width: u32, height: u32, layout: &FrameLayout) -> Result<Self> {
        Ok(Self {
            fourcc: DrmFourcc::Nv12,
            width,
            height,
            planes: vec![
                DmaBufPlane {
                    fd,
                    offset: attribute_value("luma offset", layout.y.offset)?,
                    stride: attribute_value("luma stride", layout.y.stride)?,
                },
                DmaBufPlane {
                    fd,
                    offset: attribute_value("chroma offset", layout.uv.offset)?,
                    stride: attribute_value("chroma stride", layout.uv.stride)?,
                },
            ],
            modifier: None,
        })
    }
}

fn attribute_value(name: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Nv12Error::Validation(format!("{name} {value} does not fit in 32 bits")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_is_three_halves_of_the_pixel_count() {
        for (w, h) in [(2, 2), (640, 480), (320, 240), (1920, 1080), (6, 14)] {
            assert_eq!(byte_size(w, h), (w * h * 3 / 2) as usize);
            assert_eq!(Nv12Frame::white(w, h).unwrap().byte_size(), byte_size(w, h));
        }
    }

    #[test]
    fn odd_or_tiny_dimensions_are_rejected() {
        assert!(Nv12Frame::white(3, 4).is_err());
        assert!(Nv12Frame::white(4, 5).is_err());
        assert!(Nv12Frame::white(0, 0).is_err());
    }

    #[test]
    fn write_then_read_is_byte_identical() {
        let frame = Nv12Frame::checkerboard(64, 32).unwrap();
        let path = std::env::temp_dir().join(format!("nv12-roundtrip-{}.yuv", std::process::id()));
        frame.write_to(&path).unwrap();
        let back = Nv12Frame::read_from(&path, 64, 32).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(back.y_plane(), frame.y_plane());
        assert_eq!(back.uv_plane(), frame.uv_plane());
    }

    #[test]
    fn short_files_are_an_error() {
        let path = std::env::temp_dir().join(format!("nv12-short-{}.yuv", std::process::id()));
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        let res = Nv12Frame::read_from(&path, 16, 16);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(res, Err(Nv12Error::Validation(_))));
    }

    #[test]
    fn strided_store_and_load_are_inverse() {
        let frame = Nv12Frame::checkerboard(40, 10).unwrap();
        let layout = FrameLayout {
            y: PlaneLayout {
                offset: 0,
                stride: 64,
            },
            uv: PlaneLayout {
                offset: 64 * 10 + 128,
                stride: 64,
            },
        };
        let mut buf = vec![0xAAu8; layout.total_size(10)];
        frame.store_into(&mut buf, &layout).unwrap();

        // Padding between rows is left alone.
        assert_eq!(buf[40], 0xAA);
        assert_eq!(buf[64], frame.y_plane()[40]);

        let back = Nv12Frame::load_from(&buf, 40, 10, &layout).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn packed_layout_matches_the_file_format() {
        let frame = Nv12Frame::checkerboard(32, 8).unwrap();
        let layout = FrameLayout::packed(32, 8);
        let mut buf = vec![0u8; frame.byte_size()];
        frame.store_into(&mut buf, &layout).unwrap();
        assert_eq!(&buf[..32 * 8], frame.y_plane());
        assert_eq!(&buf[32 * 8..], frame.uv_plane());
    }

    #[test]
    fn layouts_reject_overlap_and_short_strides() {
        let overlapping = FrameLayout {
            y: PlaneLayout {
                offset: 0,
                stride: 16,
            },
            uv: PlaneLayout {
                offset: 100,
                stride: 16,
            },
        };
        assert!(overlapping.validate(16, 16).is_err());

        let short = FrameLayout {
            y: PlaneLayout {
                offset: 0,
                stride: 8,
            },
            uv: PlaneLayout {
                offset: 1024,
                stride: 16,
            },
        };
        assert!(short.validate(16, 16).is_err());
        assert!(FrameLayout::packed(16, 16).validate(16, 16).is_ok());
    }

    #[test]
    fn nv12_description_shares_one_fd() {
        let desc = DmaBufImage::nv12(7, 640, 480, &FrameLayout::packed(640, 480)).unwrap();
        assert_eq!(desc.planes.len(), 2);
        assert!(desc.planes.iter().all(|p| p.fd == 7));
        assert_eq!(desc.planes[1].offset, 640 * 480);
        assert_eq!(desc.fourcc as u32, 0x3231564E);
    }

    #[test]
    fn oversized_offsets_are_refused_instead_of_wrapping() {
        let mut layout = FrameLayout::packed(64, 64);
        layout.uv.offset = u32::MAX as usize + 1;
        let res = DmaBufImage::nv12(7, 64, 64, &layout);
        assert!(matches!(res, Err(Nv12Error::Validation(ref msg)) if msg.contains("chroma offset")));

        layout.uv.offset = u32::MAX as usize;
        assert_eq!(DmaBufImage::nv12(7, 64, 64, &layout).unwrap().planes[1].offset, u32::MAX);
    }

    #[test]
    fn trailing_bytes_after_the_frame_are_ignored() {
        let path = std::env::temp_dir().join(format!("nv12-trailing-{}.yuv", std::process::id()));
        let frame = Nv12Frame::checkerboard(32, 16).unwrap();
        let mut bytes = frame.y_plane().to_vec();
        bytes.extend_from_slice(frame.uv_plane());
        bytes.extend_from_slice(&[7; 100]);
        std::fs::write(&path, &bytes).unwrap();

        let back = Nv12Frame::read_from(&path, 32, 16).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, frame);
    }
}
