//! Cross-process buffer descriptors.
//!
//! A [`BufferDescriptor`] is what travels between processes: it names the
//! shared memory region and carries the image metadata needed to interpret
//! it. It never contains addresses or lock state; those live in the
//! receiving process's [`BufferMapper`](crate::mapper::BufferMapper).
//!
//! # Wire Format
//!
//! Descriptors are serialized with rkyv. All fields are fixed-size, so every
//! encoded descriptor has the same length. Decoding validates the archive
//! and then the descriptor itself.
//!
//! ```text
//! ┌──────────┬─────────┬───────┬──────┬───────────┬──────────┐
//! │ magic    │ version │ flags │ id   │ secure_id │ share_fd │
//! ├──────────┼─────────┼───────┴──┬───┴───────────┴──────────┤
//! │ size     │ offset  │ format   │ width │ height │ stride   │
//! └──────────┴─────────┴──────────┴───────┴────────┴──────────┘
//! ```

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use bitflags::bitflags;
use std::os::unix::io::RawFd;

/// Magic number identifying a valid descriptor ("GRBD" in ASCII).
pub const DESCRIPTOR_MAGIC: u32 = 0x4752_4244;

/// Current descriptor format version.
pub const DESCRIPTOR_VERSION: u16 = 1;

bitflags! {
    /// Descriptor flags set by the allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u32 {
        /// Region is named by a secure id.
        const USES_SECURE_ID = 1 << 0;
        /// Region is a shared-memory file descriptor.
        const USES_FD = 1 << 1;
        /// Display scanout buffer; cannot be mapped by clients.
        const FRAMEBUFFER = 1 << 2;
    }
}

/// Registry key: identifies the same region in every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey {
    /// Mechanism that shares the region.
    pub backend: BackendKind,
    /// Allocator-assigned identifier.
    pub id: u64,
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:#x}", self.backend, self.id)
    }
}

/// Immutable description of a shared graphics buffer.
///
/// Created by the allocator and copied by value into every process that
/// uses the buffer. For fd-backed buffers, `share_fd` is only meaningful in
/// the process that holds that fd; [`crate::transport`] rewrites it on
/// receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferDescriptor {
    magic: u32,
    version: u16,
    flags: u32,
    id: u64,
    secure_id: u32,
    share_fd: RawFd,
    size: u64,
    offset: u64,
    format: u32,
    width: u32,
    height: u32,
    stride: u32,
}

impl BufferDescriptor {
    fn new(flags: DescriptorFlags, id: u64, size: usize) -> Self {
        Self {
            magic: DESCRIPTOR_MAGIC,
            version: DESCRIPTOR_VERSION,
            flags: flags.bits(),
            id,
            secure_id: 0,
            share_fd: -1,
            size: size as u64,
            offset: 0,
            format: PixelFormat::Rgba8888.tag(),
            width: 0,
            height: 0,
            stride: 0,
        }
    }

    /// Describe a region shared through a file descriptor.
    pub fn with_fd(id: u64, share_fd: RawFd, size: usize) -> Self {
        Self {
            share_fd,
            ..Self::new(DescriptorFlags::USES_FD, id, size)
        }
    }

    /// Describe a region named by a secure id.
    pub fn with_secure_id(id: u64, secure_id: u32, size: usize) -> Self {
        Self {
            secure_id,
            ..Self::new(DescriptorFlags::USES_SECURE_ID, id, size)
        }
    }

    /// Set the image geometry. The stride is derived from the format.
    pub fn image(mut self, format: PixelFormat, width: u32, height: u32) -> Self {
        let stride = match format.bytes_per_pixel() {
            Some(_) => width,
            None => crate::layout::plane_layout(format, width, height)
                .ok()
                .and_then(|layout| u32::try_from(layout.y_stride).ok())
                .unwrap_or(width),
        };
        self.format = format.tag();
        self.width = width;
        self.height = height;
        self.stride = stride;
        self
    }

    /// Set a raw format tag, for formats this crate has no table entry for.
    pub fn format_tag(mut self, tag: u32) -> Self {
        self.format = tag;
        self
    }

    /// Set the byte offset of the pixel data within the region.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset as u64;
        self
    }

    /// Mark the buffer as a display scanout buffer.
    pub fn scanout(mut self) -> Self {
        self.flags |= DescriptorFlags::FRAMEBUFFER.bits();
        self
    }

    /// Allocator-assigned identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Descriptor flags. Unknown bits are preserved.
    #[inline]
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_retain(self.flags)
    }

    /// Secure id of the region (secure-id backend only).
    #[inline]
    pub fn secure_id(&self) -> u32 {
        self.secure_id
    }

    /// Shared-memory file descriptor (fd backend only).
    #[inline]
    pub fn share_fd(&self) -> RawFd {
        self.share_fd
    }

    /// Total size of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Offset of the pixel data within the region.
    #[inline]
    pub fn data_offset(&self) -> usize {
        self.offset as usize
    }

    /// Raw pixel format tag.
    #[inline]
    pub fn format(&self) -> u32 {
        self.format
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in pixels as chosen by the allocator.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Is this a display scanout buffer?
    #[inline]
    pub fn is_framebuffer(&self) -> bool {
        self.flags().contains(DescriptorFlags::FRAMEBUFFER)
    }

    /// Which backend shares this region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] unless exactly one backend bit is set.
    pub fn backend(&self) -> Result<BackendKind> {
        let flags = self.flags();
        let secure = flags.contains(DescriptorFlags::USES_SECURE_ID);
        let fd = flags.contains(DescriptorFlags::USES_FD);
        match (secure, fd) {
            (true, false) => Ok(BackendKind::SecureId),
            (false, true) => Ok(BackendKind::Fd),
            _ => Err(Error::InvalidHandle(format!(
                "buffer {:#x}: unrecognized backend flags {:#x}",
                self.id, self.flags
            ))),
        }
    }

    /// Registry key of this buffer.
    pub fn key(&self) -> Result<BufferKey> {
        Ok(BufferKey {
            backend: self.backend()?,
            id: self.id,
        })
    }

    /// Check that the descriptor is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.magic != DESCRIPTOR_MAGIC {
            return Err(Error::InvalidHandle(format!(
                "bad magic {:#x}",
                self.magic
            )));
        }
        if self.version != DESCRIPTOR_VERSION {
            return Err(Error::InvalidHandle(format!(
                "unsupported descriptor version {}",
                self.version
            )));
        }
        if !self.flags().difference(DescriptorFlags::all()).is_empty() {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x}: unknown flag bits {:#x}",
                self.id, self.flags
            )));
        }
        let backend = self.backend()?;
        if self.size == 0 {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x}: zero size",
                self.id
            )));
        }
        if self.offset >= self.size {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x}: offset {} outside region of {} bytes",
                self.id, self.offset, self.size
            )));
        }
        if usize::try_from(self.size).is_err() {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x}: size {} exceeds address space",
                self.id, self.size
            )));
        }
        if backend == BackendKind::Fd && self.share_fd < 0 {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x}: invalid share fd {}",
                self.id, self.share_fd
            )));
        }
        Ok(())
    }

    /// Serialize for transfer to another process.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::ValidationFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Deserialize and validate a descriptor received from another process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] if the bytes are not a valid
    /// archive, or [`Error::InvalidHandle`] if the decoded descriptor is
    /// malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // Copy to aligned buffer for rkyv
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);

        let descriptor = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::ValidationFailed(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Copy of this descriptor referring to `share_fd` instead.
    ///
    /// Used when the fd was duplicated or received from another process.
    pub fn with_share_fd(mut self, share_fd: RawFd) -> Self {
        self.share_fd = share_fd;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv21() -> BufferDescriptor {
        BufferDescriptor::with_fd(7, 3, 1280 * 720 * 3 / 2).image(PixelFormat::YCrCb420Sp, 1280, 720)
    }

    #[test]
    fn test_fd_descriptor_validates() {
        let desc = nv21();
        desc.validate().unwrap();
        assert_eq!(desc.backend().unwrap(), BackendKind::Fd);
        assert_eq!(desc.stride(), 1280);
        assert_eq!(desc.key().unwrap(), BufferKey { backend: BackendKind::Fd, id: 7 });
        assert!(!desc.is_framebuffer());
    }

    #[test]
    fn test_secure_id_descriptor_validates() {
        let desc = BufferDescriptor::with_secure_id(9, 0xabcd, 4096);
        desc.validate().unwrap();
        assert_eq!(desc.backend().unwrap(), BackendKind::SecureId);
        assert_eq!(desc.secure_id(), 0xabcd);
    }

    #[test]
    fn test_yv12_stride_is_aligned() {
        let desc = BufferDescriptor::with_fd(1, 3, 1 << 20).image(PixelFormat::Yv12, 1000, 100);
        assert_eq!(desc.stride(), 1024);
    }

    #[test]
    fn test_oversized_image_keeps_width_as_stride() {
        let desc = BufferDescriptor::with_fd(1, 3, 4096).image(PixelFormat::Yv12, u32::MAX, u32::MAX);
        assert_eq!(desc.stride(), u32::MAX);
        assert_eq!(desc.width(), u32::MAX);
    }

    #[test]
    fn test_both_backend_bits_rejected() {
        let mut desc = nv21();
        desc.flags |= DescriptorFlags::USES_SECURE_ID.bits();
        assert!(matches!(desc.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_no_backend_bits_rejected() {
        let mut desc = nv21();
        desc.flags = 0;
        assert!(matches!(desc.backend(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_unknown_flag_bits_rejected() {
        let mut desc = nv21();
        desc.flags |= 1 << 31;
        assert!(matches!(desc.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut desc = nv21();
        desc.magic = 0;
        assert!(matches!(desc.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_offset_outside_region_rejected() {
        let desc = BufferDescriptor::with_fd(1, 3, 4096).offset(4096);
        assert!(matches!(desc.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_negative_fd_rejected() {
        let desc = BufferDescriptor::with_fd(1, -1, 4096);
        assert!(matches!(desc.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_scanout_flag() {
        let desc = nv21().scanout();
        assert!(desc.is_framebuffer());
        desc.validate().unwrap();
    }

    #[test]
    fn test_wire_encoding() {
        let desc = nv21().offset(128);
        let bytes = desc.encode().unwrap();
        assert_eq!(BufferDescriptor::decode(&bytes).unwrap(), desc);

        // Fixed size regardless of contents.
        let other = BufferDescriptor::with_secure_id(u64::MAX, u32::MAX, usize::MAX >> 1);
        assert_eq!(other.encode().unwrap().len(), bytes.len());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            BufferDescriptor::decode(&[0xff; 3]),
            Err(Error::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_descriptor() {
        let bytes = BufferDescriptor::with_fd(1, -1, 4096).encode().unwrap();
        assert!(matches!(
            BufferDescriptor::decode(&bytes),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_key_display() {
        let key = nv21().key().unwrap();
        assert_eq!(key.to_string(), "fd:0x7");
    }
}
