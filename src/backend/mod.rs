//! Mapping backends.
//!
//! A backend turns a [`BufferDescriptor`] into a mapping in the calling
//! process and keeps CPU and device views of that mapping coherent.
//!
//! # Architecture
//!
//! - [`MappingBackend`]: Trait implemented by each sharing mechanism
//! - [`SecureIdBackend`]: Regions named by a secure id, resolved through the
//!   POSIX shared-memory namespace
//! - [`FdBackend`]: Regions passed as a shared-memory / DMA-BUF file descriptor
//!
//! The [`BufferMapper`](crate::mapper::BufferMapper) is written once against
//! the trait and picks a backend from the descriptor's discriminator bits.

mod fd;
mod secure_id;

pub use fd::FdBackend;
pub use secure_id::{SecureIdBackend, secure_id_name};

use crate::descriptor::BufferDescriptor;
use crate::error::Result;
use std::ptr::NonNull;

/// Mechanism used to share a buffer's memory between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Region named by a secure id.
    SecureId,
    /// Region passed as a file descriptor.
    Fd,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::SecureId => f.write_str("secure-id"),
            BackendKind::Fd => f.write_str("fd"),
        }
    }
}

/// A live mapping of a buffer's region in this process.
///
/// `Mapping` is a plain record of addresses. It does not unmap on drop; the
/// backend that produced it must be asked to [`detach`](MappingBackend::detach) it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Start of the mapped region.
    ptr: NonNull<u8>,
    /// Length of the mapped region.
    len: usize,
    /// Offset of the pixel data from `ptr`.
    data_offset: usize,
}

impl Mapping {
    /// Create a mapping record.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` mapped bytes, and `data_offset` must be
    /// less than `len`.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, data_offset: usize) -> Self {
        debug_assert!(data_offset < len);
        Self {
            ptr,
            len,
            data_offset,
        }
    }

    /// Start of the mapped region, as returned by the mapping primitive.
    #[inline]
    pub fn region_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapped region.
    #[inline]
    pub fn region_len(&self) -> usize {
        self.len
    }

    /// Start of the pixel data.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: data_offset < len, so the result stays inside the mapping.
        unsafe { self.ptr.add(self.data_offset) }
    }

    /// Bytes available from [`base`](Self::base) to the end of the mapping.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.len - self.data_offset
    }
}

// SAFETY: A mapping is an address range, valid from any thread of the
// process that created it. Access is coordinated by the mapper's lock state.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Trait for mapping backends.
///
/// Implementations must not keep per-buffer state that outlives
/// [`detach`](Self::detach); the mapper owns all bookkeeping.
pub trait MappingBackend: Send + Sync {
    /// Which descriptors this backend handles.
    fn kind(&self) -> BackendKind;

    /// Map `desc`'s region into this process.
    fn attach(&self, desc: &BufferDescriptor) -> Result<Mapping>;

    /// Release a mapping produced by [`attach`](Self::attach).
    ///
    /// Called exactly once per mapping.
    fn detach(&self, desc: &BufferDescriptor, mapping: Mapping) -> Result<()>;

    /// Make CPU writes visible to the device (flush, CPU→device).
    fn sync_to_device(&self, desc: &BufferDescriptor, mapping: &Mapping) -> Result<()>;

    /// Make device writes visible to the CPU (invalidate, device→CPU).
    fn sync_to_cpu(&self, desc: &BufferDescriptor, mapping: &Mapping) -> Result<()>;
}

/// Map `len` bytes of `fd` shared and read-write.
pub(crate) fn map_shared<Fd: rustix::fd::AsFd>(fd: Fd, len: usize) -> rustix::io::Result<NonNull<u8>> {
    use rustix::mm::{MapFlags, ProtFlags};

    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)
}

/// Unmap a region produced by [`map_shared`].
pub(crate) fn unmap(mapping: Mapping) -> rustix::io::Result<()> {
    // SAFETY: the mapper detaches each mapping exactly once.
    unsafe { rustix::mm::munmap(mapping.region_ptr().as_ptr().cast(), mapping.region_len()) }
}

/// `msync` the whole mapped region.
pub(crate) fn msync(mapping: &Mapping, flags: rustix::mm::MsyncFlags) -> rustix::io::Result<()> {
    // SAFETY: the region stays mapped while a lock claim is outstanding.
    unsafe { rustix::mm::msync(mapping.region_ptr().as_ptr().cast(), mapping.region_len(), flags) }
}
