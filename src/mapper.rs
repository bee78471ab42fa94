//! Buffer lifecycle management.
//!
//! [`BufferMapper`] owns every registered buffer's runtime state in this
//! process. Registration maps the buffer, locks hand out CPU pointers, and
//! unregistration unmaps it, deferring the unmap while any lock is
//! outstanding.
//!
//! # Locking
//!
//! One mutex guards the whole registry. Flag transitions and the backend's
//! attach/detach calls run under it, so two threads can never map or unmap
//! the same buffer twice. Coherence calls (invalidate on lock, flush on
//! unlock) run outside it; the caller's outstanding claim keeps the mapping
//! alive across that window.
//!
//! # Example
//!
//! ```rust,ignore
//! use gralloc_mapper::{Access, BufferMapper};
//!
//! let mapper = BufferMapper::new();
//! mapper.register(&desc)?;
//!
//! let view = mapper.lock(&desc, Access::Write)?;
//! if let Some(planes) = view.planes() {
//!     // write luma at planes.y, chroma at planes.cb / planes.cr
//! }
//! mapper.unlock(&desc)?;
//!
//! mapper.unregister(&desc)?;
//! ```

use crate::backend::{BackendKind, FdBackend, Mapping, MappingBackend, SecureIdBackend};
use crate::config::MapperConfig;
use crate::descriptor::{BufferDescriptor, BufferKey};
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::layout::{YcbcrPlanes, plane_layout, resolve_planes};
use crate::state::{
    Access, BufferRuntimeState, BufferState, Claim, LockSnapshot, UnregisterStep,
};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Registry = HashMap<BufferKey, BufferRuntimeState>;

type PidSource = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Result of [`BufferMapper::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The buffer was unmapped.
    Unmapped,
    /// The buffer is still locked; the last unlock unmaps it.
    Deferred,
    /// The mapping belongs to another process and was left alone.
    SkippedForeign,
}

/// CPU view of a locked buffer.
///
/// Pointers are valid until the matching [`BufferMapper::unlock`].
#[derive(Debug, Clone, Copy)]
pub struct LockedView {
    key: BufferKey,
    access: Access,
    base: NonNull<u8>,
    len: usize,
    planes: Option<YcbcrPlanes>,
}

impl LockedView {
    /// Registry key of the locked buffer.
    pub fn key(&self) -> BufferKey {
        self.key
    }

    /// Access granted by the lock.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Start of the pixel data.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Bytes addressable from [`base`](Self::base).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are addressable.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Plane pointers, for planar formats.
    pub fn planes(&self) -> Option<&YcbcrPlanes> {
        self.planes.as_ref()
    }

    /// The pixel data as a byte slice.
    ///
    /// # Safety
    ///
    /// The buffer must still be locked, and no other thread or process may
    /// write to it while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: base points to len mapped bytes while the lock is held.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// The pixel data as a mutable byte slice.
    ///
    /// Returns `None` for read-only locks.
    ///
    /// # Safety
    ///
    /// The buffer must still be locked, and the caller must have exclusive
    /// access to the memory while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        self.access
            .writes()
            // SAFETY: caller guarantees exclusive access.
            .then(|| unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) })
    }
}

/// Process-wide registry of mapped buffers.
///
/// `BufferMapper` is `Send + Sync`; share it between threads with an `Arc`.
pub struct BufferMapper {
    config: MapperConfig,
    secure_id: Arc<dyn MappingBackend>,
    fd: Arc<dyn MappingBackend>,
    pid: PidSource,
    registry: Mutex<Registry>,
}

impl Default for BufferMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferMapper")
            .field("config", &self.config)
            .field("registered", &self.registered_count())
            .finish()
    }
}

impl BufferMapper {
    /// Create a mapper with the default configuration and system backends.
    pub fn new() -> Self {
        Self::with_config(MapperConfig::default())
    }

    /// Create a mapper with the system backends.
    pub fn with_config(config: MapperConfig) -> Self {
        let secure_id = Arc::new(SecureIdBackend::new(config.secure_id_namespace.clone()));
        Self::with_backends(config, secure_id, Arc::new(FdBackend::new()))
    }

    /// Create a mapper with explicit backends.
    ///
    /// # Panics
    ///
    /// Panics if a backend reports the wrong [`BackendKind`].
    pub fn with_backends(
        config: MapperConfig,
        secure_id: Arc<dyn MappingBackend>,
        fd: Arc<dyn MappingBackend>,
    ) -> Self {
        assert_eq!(secure_id.kind(), BackendKind::SecureId, "secure-id backend expected");
        assert_eq!(fd.kind(), BackendKind::Fd, "fd backend expected");
        Self {
            config,
            secure_id,
            fd,
            pid: Arc::new(std::process::id),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the source of the current process id.
    ///
    /// Ownership checks compare the registering pid with the pid at the time
    /// of the call, so a mapper inherited across `fork` refuses to unmap the
    /// parent's mappings.
    pub fn with_pid_source(mut self, pid: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.pid = Arc::new(pid);
        self
    }

    /// The mapper's configuration.
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    fn current_pid(&self) -> u32 {
        (self.pid)()
    }

    fn backend(&self, kind: BackendKind) -> &dyn MappingBackend {
        match kind {
            BackendKind::SecureId => self.secure_id.as_ref(),
            BackendKind::Fd => self.fd.as_ref(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Every transition is a single update of one record, so a panic
        // while holding the lock cannot leave a record half-changed.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `desc` and refuse scanout buffers.
    fn checked_key(desc: &BufferDescriptor, op: &str) -> Result<BufferKey> {
        if let Err(err) = desc.validate() {
            tracing::warn!(id = desc.id(), op, error = %err, "invalid descriptor");
            return Err(err);
        }
        if desc.is_framebuffer() {
            tracing::warn!(id = desc.id(), op, "refusing scanout buffer");
            return Err(Error::Unsupported(format!(
                "cannot {} scanout buffer {:#x}",
                op,
                desc.id()
            )));
        }
        desc.key()
    }

    /// Map `desc` into this process.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if the descriptor is malformed, or the
    ///   buffer is already registered (or still pending unmap) in this process
    /// - [`Error::Unsupported`] for scanout buffers
    /// - [`Error::MappingFailed`] if the backend cannot map the region; no
    ///   state is recorded in that case
    pub fn register(&self, desc: &BufferDescriptor) -> Result<()> {
        let key = Self::checked_key(desc, "register")?;
        let pid = self.current_pid();

        let mut registry = self.registry();

        if let Some(existing) = registry.get(&key) {
            if existing.owning_pid() == pid {
                let reason = if existing.is_pending_unmap() {
                    "unregister still pending"
                } else {
                    "already registered"
                };
                tracing::warn!(%key, pid, reason, "refusing duplicate registration");
                return Err(Error::InvalidHandle(format!("buffer {key}: {reason}")));
            }
            // Inherited from another process: that mapping is not ours to
            // unmap or to reuse.
            tracing::warn!(
                %key,
                pid,
                owner = existing.owning_pid(),
                "discarding stale entry from another process"
            );
            registry.remove(&key);
        }

        let mapping = self.backend(key.backend).attach(desc).inspect_err(|err| {
            tracing::error!(%key, error = %err, "failed to map buffer");
        })?;
        registry.insert(key, BufferRuntimeState::new(*desc, mapping, pid));

        tracing::debug!(
            %key,
            pid,
            size = desc.size(),
            base = ?mapping.base(),
            "registered buffer"
        );
        Ok(())
    }

    /// Unmap `desc` from this process.
    ///
    /// If the buffer is locked, it stops accepting new locks immediately but
    /// stays mapped until the last outstanding lock is released. Callers
    /// must not assume the memory is reclaimed when this returns
    /// [`UnregisterOutcome::Deferred`].
    ///
    /// A buffer registered by a different process is left mapped and
    /// reported as [`UnregisterOutcome::SkippedForeign`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if the descriptor is malformed, or the
    ///   buffer is not registered (or already unregistered) in this process
    /// - [`Error::Unsupported`] for scanout buffers
    /// - [`Error::MappingFailed`] if the backend failed to unmap; the
    ///   buffer is forgotten regardless
    pub fn unregister(&self, desc: &BufferDescriptor) -> Result<UnregisterOutcome> {
        let key = Self::checked_key(desc, "unregister")?;
        let pid = self.current_pid();

        let mut registry = self.registry();

        let Some(state) = registry.get_mut(&key) else {
            return Err(Error::InvalidHandle(format!("buffer {key} is not registered")));
        };

        if state.owning_pid() != pid {
            let violation = Error::CrossProcessViolation {
                id: key.id,
                owner: state.owning_pid(),
                caller: pid,
            };
            tracing::warn!(%key, error = %violation, "not unmapping buffer of another process");
            return Ok(UnregisterOutcome::SkippedForeign);
        }

        if state.is_pending_unmap() {
            return Err(Error::InvalidHandle(format!(
                "buffer {key} is already unregistered"
            )));
        }

        match state.unregister() {
            UnregisterStep::UnmapNow => {
                self.unmap_entry(&mut registry, &key)?;
                Ok(UnregisterOutcome::Unmapped)
            }
            UnregisterStep::Defer => {
                tracing::debug!(%key, state = ?state.snapshot(), "unregister deferred until unlock");
                Ok(UnregisterOutcome::Deferred)
            }
        }
    }

    /// Lock `desc` for CPU access.
    ///
    /// Planar formats also get their plane pointers resolved.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if the descriptor is malformed, not
    ///   registered, or already unregistered; the buffer state is untouched
    /// - [`Error::InvalidHandle`] if a planar image does not fit in the
    ///   mapping; the lock is rolled back
    /// - [`Error::MappingFailed`] if the invalidate fails; the lock is
    ///   rolled back
    pub fn lock(&self, desc: &BufferDescriptor, access: Access) -> Result<LockedView> {
        desc.validate()?;
        let key = desc.key()?;

        let (registered, mapping) = {
            let mut registry = self.registry();
            let state = registry
                .get_mut(&key)
                .ok_or_else(|| Error::InvalidHandle(format!("buffer {key} is not registered")))?;
            if let Err(err) = state.begin_lock(access) {
                tracing::warn!(%key, ?access, "lock on unregistered buffer");
                return Err(err);
            }
            (*state.desc(), state.mapping())
        };

        match self.prepare_view(key, &registered, &mapping, access) {
            Ok(view) => {
                tracing::trace!(%key, ?access, "locked buffer");
                Ok(view)
            }
            Err(err) => {
                tracing::warn!(%key, ?access, error = %err, "lock failed, rolling back");
                let mut registry = self.registry();
                if registry.get_mut(&key).is_some_and(|state| state.cancel_lock(access)) {
                    // Already logged by unmap_entry; the lock error is the one to report.
                    let _ = self.unmap_entry(&mut registry, &key);
                }
                Err(err)
            }
        }
    }

    /// Coherence and plane resolution, run without the registry lock.
    fn prepare_view(
        &self,
        key: BufferKey,
        desc: &BufferDescriptor,
        mapping: &Mapping,
        access: Access,
    ) -> Result<LockedView> {
        let base = mapping.base();
        let planes = match PixelFormat::from_tag(desc.format()) {
            Some(format) if format.is_planar() => {
                let layout = plane_layout(format, desc.width(), desc.height())?;
                let needed = layout.len(desc.height() as usize);
                if needed > mapping.data_len() {
                    return Err(Error::InvalidHandle(format!(
                        "buffer {key}: {format:?} {}x{} needs {needed} bytes, {} mapped",
                        desc.width(),
                        desc.height(),
                        mapping.data_len()
                    )));
                }
                Some(resolve_planes(
                    desc.format(),
                    base.as_ptr(),
                    desc.width(),
                    desc.height(),
                )?)
            }
            _ => None,
        };

        if self.config.sync_on_lock {
            self.backend(key.backend).sync_to_cpu(desc, mapping)?;
        }

        Ok(LockedView {
            key,
            access,
            base,
            len: mapping.data_len(),
            planes,
        })
    }

    /// Release one lock on `desc`.
    ///
    /// Write locks are released before read locks. Releasing a write lock
    /// flushes CPU writes to the device while the mapping is still valid;
    /// if the buffer was unregistered and this was its last lock, it is then
    /// unmapped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if the descriptor is malformed, not
    ///   registered, or not locked
    /// - [`Error::MappingFailed`] if the flush or the deferred unmap failed;
    ///   the lock is released regardless
    pub fn unlock(&self, desc: &BufferDescriptor) -> Result<()> {
        desc.validate()?;
        let key = desc.key()?;

        let (claim, registered, mapping) = {
            let mut registry = self.registry();
            let state = registry
                .get_mut(&key)
                .ok_or_else(|| Error::InvalidHandle(format!("buffer {key} is not registered")))?;
            (state.begin_unlock()?, *state.desc(), state.mapping())
        };

        let flushed = if claim == Claim::Write && self.config.sync_on_unlock {
            self.backend(key.backend).sync_to_device(&registered, &mapping)
        } else {
            Ok(())
        };
        if let Err(err) = &flushed {
            tracing::error!(%key, error = %err, "flush on unlock failed");
        }

        let finished = {
            let mut registry = self.registry();
            match registry.get_mut(&key).map(BufferRuntimeState::finish_unlock) {
                Some(true) => {
                    tracing::debug!(%key, "performing deferred unmap");
                    self.unmap_entry(&mut registry, &key)
                }
                Some(false) => Ok(()),
                None => Err(Error::InvalidHandle(format!(
                    "buffer {key} vanished during unlock"
                ))),
            }
        };

        tracing::trace!(%key, ?claim, "unlocked buffer");
        flushed.and(finished)
    }

    /// Drop `key`'s record and unmap it. Caller holds the registry lock.
    ///
    /// A record created by another process is dropped without unmapping.
    fn unmap_entry(&self, registry: &mut Registry, key: &BufferKey) -> Result<()> {
        let Some(state) = registry.remove(key) else {
            return Ok(());
        };
        let pid = self.current_pid();
        if state.owning_pid() != pid {
            let violation = Error::CrossProcessViolation {
                id: key.id,
                owner: state.owning_pid(),
                caller: pid,
            };
            tracing::warn!(%key, error = %violation, "dropping record without unmapping");
            return Ok(());
        }
        self.backend(key.backend)
            .detach(state.desc(), state.mapping())
            .inspect_err(|err| tracing::error!(%key, error = %err, "failed to unmap buffer"))?;
        tracing::debug!(%key, "unmapped buffer");
        Ok(())
    }

    /// Current state of `desc` in this process.
    pub fn state(&self, desc: &BufferDescriptor) -> BufferState {
        let Ok(key) = desc.key() else {
            return BufferState::Unmapped;
        };
        self.registry()
            .get(&key)
            .map_or(BufferState::Unmapped, BufferRuntimeState::state)
    }

    /// Lock bookkeeping of `desc`, if registered.
    pub fn lock_state(&self, desc: &BufferDescriptor) -> Option<LockSnapshot> {
        let key = desc.key().ok()?;
        self.registry().get(&key).map(BufferRuntimeState::snapshot)
    }

    /// Base address of `desc`'s pixel data, while mapped and not unregistered.
    pub fn mapped_base(&self, desc: &BufferDescriptor) -> Option<NonNull<u8>> {
        let key = desc.key().ok()?;
        self.registry().get(&key).and_then(BufferRuntimeState::mapped_base)
    }

    /// Number of buffers with runtime state in this process, including those
    /// pending unmap.
    pub fn registered_count(&self) -> usize {
        self.registry().len()
    }
}

impl Drop for BufferMapper {
    fn drop(&mut self) {
        if !self.config.unmap_on_drop {
            return;
        }
        let pid = self.current_pid();
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for (key, state) in registry.drain() {
            if state.owning_pid() != pid {
                continue;
            }
            tracing::debug!(%key, state = ?state.state(), "unmapping leftover buffer");
            let backend = match key.backend {
                BackendKind::SecureId => &self.secure_id,
                BackendKind::Fd => &self.fd,
            };
            if let Err(err) = backend.detach(state.desc(), state.mapping()) {
                tracing::error!(%key, error = %err, "failed to unmap leftover buffer");
            }
        }
    }
}
