use std::{
    ffi::{c_void, CString},
    io,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr::NonNull,
};

use crate::types::error::{Nv12Error, Result};

/// `_IOW('b', 0, struct dma_buf_sync)`
const DMA_BUF_IOCTL_SYNC: u64 = 0x4008_6200;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

/// A shared, writable CPU mapping of a dma-buf (or any mappable fd).
/// The mapping is released on drop.
pub struct MappedDmaBuf<'fd> {
    fd: BorrowedFd<'fd>,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'fd> MappedDmaBuf<'fd> {
    pub fn map(fd: BorrowedFd<'fd>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Nv12Error::Validation("cannot map an empty dma-buf".into()));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Nv12Error::Io(io::Error::last_os_error()));
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Nv12Error::Other("mmap returned a null mapping".into()))?;
        log::trace!("Mapped {len} bytes of fd {}", fd.as_raw_fd());

        Ok(Self { fd, ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Brackets CPU access so the exporter can flush or invalidate caches.
    pub fn begin_cpu_access(&self) -> Result<()> {
        self.sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW)
    }

    pub fn end_cpu_access(&self) -> Result<()> {
        self.sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW)
    }

    /// Writes the mapping back to the underlying object.
    pub fn flush(&self) -> Result<()> {
        let ret = unsafe {
            libc::msync(self.ptr.as_ptr() as *mut c_void, self.len, libc::MS_SYNC)
        };
        if ret != 0 {
            return Err(Nv12Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn sync(&self, flags: u64) -> Result<()> {
        let mut sync = DmaBufSync { flags };
        loop {
            let ret = unsafe {
                libc::ioctl(
                    self.fd.as_raw_fd(),
                    DMA_BUF_IOCTL_SYNC as _,
                    &mut sync as *mut DmaBufSync,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(Nv12Error::Io(err)),
            }
        }
    }
}

impl Drop for MappedDmaBuf<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

/// Anonymous memory-backed descriptor of `len` bytes, standing in for a
/// real dma-buf when no allocator is at hand.
pub fn memfd_buffer(name: &str, len: usize) -> Result<OwnedFd> {
    let c_name = CString::new(name)
        .map_err(|_| Nv12Error::Validation(format!("invalid memfd name {name:?}")))?;

    let raw = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(Nv12Error::Io(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(Nv12Error::Io(io::Error::last_os_error()));
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;
    use crate::types::frame::{FrameLayout, Nv12Frame};

    #[test]
    fn memfd_mapping_holds_a_frame() {
        let frame = Nv12Frame::checkerboard(64, 64).unwrap();
        let layout = FrameLayout::packed(64, 64);
        let fd = memfd_buffer("nv12-test", frame.byte_size()).unwrap();

        {
            let mut map = MappedDmaBuf::map(fd.as_fd(), frame.byte_size()).unwrap();
            frame.store_into(map.as_mut_slice(), &layout).unwrap();
            map.flush().unwrap();
        }

        // A second mapping of the same descriptor sees the same bytes.
        let map = MappedDmaBuf::map(fd.as_fd(), frame.byte_size()).unwrap();
        assert_eq!(map.len(), frame.byte_size());
        let back = Nv12Frame::load_from(map.as_slice(), 64, 64, &layout).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn sync_on_a_plain_memfd_is_rejected() {
        let fd = memfd_buffer("nv12-sync", 4096).unwrap();
        let map = MappedDmaBuf::map(fd.as_fd(), 4096).unwrap();
        assert!(map.begin_cpu_access().is_err());
    }

    #[test]
    fn empty_mappings_are_refused() {
        let fd = memfd_buffer("nv12-empty", 0).unwrap();
        assert!(MappedDmaBuf::map(fd.as_fd(), 0).is_err());
    }
}
