use std::{
    fs::{File, OpenOptions},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::Path,
};

use drm_fourcc::{DrmFourcc, DrmModifier};
use drm::{buffer::Buffer as DrmBuffer, control::Device as DrmControlDevice, Device as DrmDevice};
use gbm::{BufferObject, BufferObjectFlags, Device};

use crate::{
    dmabuf::MappedDmaBuf,
    types::{
        error::{Nv12Error, Result},
        frame::{DmaBufImage, FrameLayout, Nv12Frame, PlaneLayout},
    },
};

/// An opened DRM render node.
#[derive(Debug)]
pub struct RenderNode(File);

impl AsFd for RenderNode {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DrmDevice for RenderNode {}
impl DrmControlDevice for RenderNode {}

impl RenderNode {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Nv12Error::Gbm(format!("Failed to open {}: {e}", path.display())))?;
        log::debug!("Opened render node {}", path.display());
        Ok(Self(file))
    }
}

/// A linear NV12 buffer object allocated through GBM.
pub struct Nv12Buffer {
    // Keeps the GBM device alive for as long as the buffer object.
    device: Device<RenderNode>,
    bo: BufferObject<()>,
    width: u32,
    height: u32,
    layout: FrameLayout,
    modifier: Option<u64>,
}

impl Nv12Buffer {
    pub fn allocate(node: RenderNode, width: u32, height: u32) -> Result<Self> {
        let device = Device::new(node)
            .map_err(|e| Nv12Error::Gbm(format!("Failed to create GBM device: {e}")))?;

        let bo = device
            .create_buffer_object::<()>(
                width,
                height,
                DrmFourcc::Nv12,
                BufferObjectFlags::RENDERING | BufferObjectFlags::LINEAR,
            )
            .or_else(|e| {
                log::debug!("NV12 render target allocation failed ({e}), retrying as linear only");
                device.create_buffer_object::<()>(
                    width,
                    height,
                    DrmFourcc::Nv12,
                    BufferObjectFlags::LINEAR,
                )
            })
            .map_err(|e| {
                Nv12Error::Gbm(format!("Failed to allocate {width}x{height} NV12 buffer: {e}"))
            })?;

        let plane_count = bo.plane_count();
        let planes: Vec<(u32, u32)> = (0..plane_count.min(2) as i32)
            .map(|plane| (bo.offset(plane), bo.stride_for_plane(plane)))
            .collect();
        let layout = layout_from_planes(&planes, width, height)?;

        let modifier = match bo.modifier() {
            DrmModifier::Invalid => None,
            m => Some(u64::from(m)),
        };

        log::info!(
            "Allocated {width}x{height} NV12 buffer: {plane_count} plane(s), strides {}/{}, chroma offset {}",
            layout.y.stride,
            layout.uv.stride,
            layout.uv.offset
        );

        Ok(Self {
            device,
            bo,
            width,
            height,
            layout,
            modifier,
        })
    }

    /// Exports the buffer as a dma-buf, through GBM first and PRIME otherwise.
    pub fn export(&self) -> Result<OwnedFd> {
        match self.bo.fd() {
            Ok(fd) => {
                log::debug!("Exported buffer via gbm_bo_get_fd: fd {}", fd.as_raw_fd());
                Ok(fd)
            }
            Err(e) => {
                log::debug!("gbm_bo_get_fd failed ({e}), trying PRIME export");
                let handle = DrmBuffer::handle(&self.bo);
                let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
                let fd = self
                    .device
                    .buffer_to_prime_fd(handle, flags)
                    .map_err(|e| Nv12Error::Gbm(format!("PRIME export failed: {e}")))?;
                log::debug!("Exported buffer via PRIME: fd {}", fd.as_raw_fd());
                Ok(fd)
            }
        }
    }

    /// Copies `frame` into the exported buffer through a CPU mapping.
    pub fn fill(&self, fd: BorrowedFd<'_>, frame: &Nv12Frame) -> Result<()> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(Nv12Error::Validation(format!(
                "frame is {}x{}, buffer is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let mut map = MappedDmaBuf::map(fd, self.mapped_size())?;
        let synced = match map.begin_cpu_access() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("DMA_BUF_IOCTL_SYNC unavailable: {e}");
                false
            }
        };

        frame.store_into(map.as_mut_slice(), &self.layout)?;

        if synced {
            map.end_cpu_access()?;
        }
        map.flush()?;
        log::trace!("Filled {} bytes of the NV12 buffer", map.len());
        Ok(())
    }

    /// Describes the exported buffer for EGL import.
    pub fn image_description(&self, fd: BorrowedFd<'_>) -> Result<DmaBufImage> {
        let mut image =
            DmaBufImage::nv12(fd.as_raw_fd(), self.width, self.height, &self.layout)?;
        image.modifier = self.modifier;
        Ok(image)
    }

    pub fn mapped_size(&self) -> usize {
        self.layout.total_size(self.height)
    }
}

/// Builds the frame layout from `(offset, stride)` pairs reported per plane.
/// Drivers that report a single plane get the chroma plane placed right after
/// the luma rows.
fn layout_from_planes(planes: &[(u32, u32)], width: u32, height: u32) -> Result<FrameLayout> {
    let layout = match planes {
        [(y_offset, y_stride), (uv_offset, uv_stride)] => FrameLayout {
            y: PlaneLayout {
                offset: *y_offset as usize,
                stride: *y_stride as usize,
            },
            uv: PlaneLayout {
                offset: *uv_offset as usize,
                stride: *uv_stride as usize,
            },
        },
        [(y_offset, y_stride)] => FrameLayout {
            y: PlaneLayout {
                offset: *y_offset as usize,
                stride: *y_stride as usize,
            },
            uv: PlaneLayout {
                offset: (*y_offset + *y_stride * height) as usize,
                stride: *y_stride as usize,
            },
        },
        _ => return Err(Nv12Error::Gbm("buffer object reports no planes".into())),
    };
    layout.validate(width, height)?;
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_plane_layout_is_taken_verbatim() {
        let layout = layout_from_planes(&[(0, 768), (768 * 480, 768)], 640, 480).unwrap();
        assert_eq!(layout.y.stride, 768);
        assert_eq!(layout.uv.offset, 768 * 480);
        assert_eq!(layout.total_size(480), 768 * 480 + 768 * 240);
    }

    #[test]
    fn single_plane_layout_puts_chroma_after_luma() {
        let layout = layout_from_planes(&[(0, 640)], 640, 480).unwrap();
        assert_eq!(layout, FrameLayout::packed(640, 480));
    }

    #[test]
    fn bogus_plane_reports_are_rejected() {
        assert!(layout_from_planes(&[], 64, 64).is_err());
        assert!(layout_from_planes(&[(0, 32), (64 * 32, 32)], 64, 64).is_err());
    }

    #[test]
    fn missing_render_node_is_a_gbm_error() {
        let res = RenderNode::open("/nonexistent/renderD999");
        assert!(matches!(res, Err(Nv12Error::Gbm(_))));
    }
}
