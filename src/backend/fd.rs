//! File-descriptor backend.
//!
//! Maps regions passed as a memfd, shm or DMA-BUF file descriptor. The fd
//! is borrowed from the descriptor; closing it is the caller's business and
//! does not invalidate an established mapping.

use super::{BackendKind, Mapping, MappingBackend, map_shared, msync, unmap};
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::MsyncFlags;

/// Backend for fd-shared regions.
///
/// The whole region is mapped from offset 0 and the descriptor's data offset
/// is applied to the resulting address, so the mapping length never depends
/// on page alignment of the offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdBackend;

impl FdBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

impl MappingBackend for FdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fd
    }

    fn attach(&self, desc: &BufferDescriptor) -> Result<Mapping> {
        // SAFETY: the descriptor was validated, so share_fd is non-negative;
        // the caller keeps it open for the duration of the call.
        let fd = unsafe { BorrowedFd::borrow_raw(desc.share_fd()) };
        let ptr = map_shared(fd, desc.size()).map_err(|e| Error::mapping(desc.id(), e))?;

        tracing::trace!(
            id = desc.id(),
            fd = desc.share_fd(),
            size = desc.size(),
            "mapped share fd"
        );

        // SAFETY: mmap returned size bytes and validate() ensured offset < size.
        Ok(unsafe { Mapping::new(ptr, desc.size(), desc.data_offset()) })
    }

    fn detach(&self, desc: &BufferDescriptor, mapping: Mapping) -> Result<()> {
        unmap(mapping).map_err(|e| Error::mapping(desc.id(), e))
    }

    fn sync_to_device(&self, desc: &BufferDescriptor, mapping: &Mapping) -> Result<()> {
        msync(mapping, MsyncFlags::SYNC).map_err(|e| Error::mapping(desc.id(), e))
    }

    fn sync_to_cpu(&self, desc: &BufferDescriptor, mapping: &Mapping) -> Result<()> {
        msync(mapping, MsyncFlags::INVALIDATE).map_err(|e| Error::mapping(desc.id(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsRawFd;

    fn memfd(size: usize) -> rustix::fd::OwnedFd {
        let fd = rustix::fs::memfd_create("test_fd_backend", rustix::fs::MemfdFlags::CLOEXEC)
            .unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        fd
    }

    #[test]
    fn test_attach_detach() {
        let fd = memfd(4096);
        let desc = BufferDescriptor::with_fd(1, fd.as_raw_fd(), 4096);
        let backend = FdBackend::new();

        let mapping = backend.attach(&desc).unwrap();
        assert_eq!(mapping.region_len(), 4096);
        assert_eq!(mapping.base(), mapping.region_ptr());

        backend.detach(&desc, mapping).unwrap();
    }

    #[test]
    fn test_offset_applied() {
        let fd = memfd(8192);
        let desc = BufferDescriptor::with_fd(2, fd.as_raw_fd(), 8192).offset(100);
        let backend = FdBackend::new();

        let mapping = backend.attach(&desc).unwrap();
        unsafe {
            *mapping.region_ptr().as_ptr().add(100) = 0x5a;
            assert_eq!(*mapping.base().as_ptr(), 0x5a);
        }
        assert_eq!(mapping.data_len(), 8092);
        backend.detach(&desc, mapping).unwrap();
    }

    #[test]
    fn test_two_mappings_share_pages() {
        let fd = memfd(4096);
        let desc = BufferDescriptor::with_fd(3, fd.as_raw_fd(), 4096);
        let backend = FdBackend::new();

        let a = backend.attach(&desc).unwrap();
        let b = backend.attach(&desc).unwrap();
        assert_ne!(a.region_ptr(), b.region_ptr());

        unsafe {
            *a.base().as_ptr().add(10) = 77;
            assert_eq!(*b.base().as_ptr().add(10), 77);
        }

        backend.detach(&desc, a).unwrap();
        backend.detach(&desc, b).unwrap();
    }

    #[test]
    fn test_sync_calls_succeed() {
        let fd = memfd(4096);
        let desc = BufferDescriptor::with_fd(4, fd.as_raw_fd(), 4096);
        let backend = FdBackend::new();

        let mapping = backend.attach(&desc).unwrap();
        backend.sync_to_cpu(&desc, &mapping).unwrap();
        backend.sync_to_device(&desc, &mapping).unwrap();
        backend.detach(&desc, mapping).unwrap();
    }

    #[test]
    fn test_attach_bad_fd_fails() {
        // A pipe cannot be mapped.
        let (reader, _writer) = rustix::pipe::pipe().unwrap();
        let desc = BufferDescriptor::with_fd(5, reader.as_raw_fd(), 4096);

        let err = FdBackend::new().attach(&desc).unwrap_err();
        assert!(matches!(err, Error::MappingFailed { id: 5, .. }));
    }
}
