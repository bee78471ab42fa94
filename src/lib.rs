//! # gralloc-mapper
//!
//! Cross-process graphics buffer mapping for Linux.
//!
//! A graphics allocator hands out buffers as [`BufferDescriptor`]s. Any
//! process that receives a descriptor can register it with a
//! [`BufferMapper`] to map the memory, lock it for CPU access, and
//! unregister it when done. Unmapping is deferred while a lock is
//! outstanding, so a buffer can be unregistered from one thread while
//! another is still writing to it.
//!
//! ## Features
//!
//! - **Two sharing backends**: secure ids resolved through POSIX shared
//!   memory, and shared-memory / DMA-BUF file descriptors
//! - **Deferred unmap**: unregister under lock never yanks memory away
//! - **YCbCr plane resolution**: NV21, NV12 and YV12 plane pointers on lock
//! - **Descriptor transport**: rkyv encoding plus `SCM_RIGHTS` fd passing
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gralloc_mapper::prelude::*;
//!
//! let mapper = BufferMapper::new();
//! let desc = BufferDescriptor::with_fd(1, fd, size)
//!     .image(PixelFormat::YCrCb420Sp, 1280, 720);
//!
//! mapper.register(&desc)?;
//! let view = mapper.lock(&desc, Access::Write)?;
//! let planes = view.planes().unwrap();
//! // ... fill planes.y, planes.cr, planes.cb ...
//! mapper.unlock(&desc)?;
//! mapper.unregister(&desc)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod layout;
pub mod mapper;
pub mod state;
pub mod transport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendKind, MappingBackend};
    pub use crate::config::MapperConfig;
    pub use crate::descriptor::{BufferDescriptor, BufferKey, DescriptorFlags};
    pub use crate::error::{Error, Result};
    pub use crate::format::PixelFormat;
    pub use crate::layout::{PlaneLayout, YcbcrPlanes, resolve_planes};
    pub use crate::mapper::{BufferMapper, LockedView, UnregisterOutcome};
    pub use crate::state::{Access, BufferState, LockFlags, LockSnapshot};
}

pub use descriptor::BufferDescriptor;
pub use error::{Error, Result};
pub use format::PixelFormat;
pub use layout::resolve_planes;
pub use mapper::{BufferMapper, LockedView, UnregisterOutcome};
pub use state::{Access, BufferState};
