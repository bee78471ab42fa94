//! Secure-id backend.
//!
//! A secure id is a system-wide capability naming a shared memory region.
//! Ids are resolved through the POSIX shared-memory namespace: the allocator
//! exports region `id` as the object [`secure_id_name`]`(namespace, id)`, and
//! every process that registers the buffer opens that name and maps it.

use super::{BackendKind, Mapping, MappingBackend, map_shared, msync, unmap};
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::mm::MsyncFlags;
use rustix::shm;

/// Name of the shared-memory object that backs `secure_id`.
///
/// ```
/// use gralloc_mapper::backend::secure_id_name;
///
/// assert_eq!(secure_id_name("gralloc", 0x2a), "/gralloc-0000002a");
/// ```
pub fn secure_id_name(namespace: &str, secure_id: u32) -> String {
    format!("/{namespace}-{secure_id:08x}")
}

/// Backend for regions named by a secure id.
#[derive(Debug, Clone)]
pub struct SecureIdBackend {
    /// Prefix of the shared-memory object names.
    namespace: String,
}

impl SecureIdBackend {
    /// Create a backend resolving ids within `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace ids are resolved in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl MappingBackend for SecureIdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SecureId
    }

    fn attach(&self, desc: &BufferDescriptor) -> Result<Mapping> {
        let name = secure_id_name(&self.namespace, desc.secure_id());
        let fd = shm::open(name.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| Error::mapping(desc.id(), e))?;

        // Mapping past the end of the object would fault on first touch.
        let stat = rustix::fs::fstat(&fd).map_err(|e| Error::mapping(desc.id(), e))?;
        if (stat.st_size as u64) < desc.size() as u64 {
            tracing::warn!(
                id = desc.id(),
                name = %name,
                object_size = stat.st_size,
                size = desc.size(),
                "secure id object smaller than descriptor"
            );
            return Err(Error::mapping(desc.id(), Errno::INVAL));
        }

        let ptr = map_shared(&fd, desc.size()).map_err(|e| Error::mapping(desc.id(), e))?;

        tracing::trace!(id = desc.id(), name = %name, size = desc.size(), "attached secure id");

        // The mapping keeps the object alive; the fd is closed here.
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
