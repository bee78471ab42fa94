//! Per-process buffer runtime state and its transitions.
//!
//! Each registered buffer has one [`BufferRuntimeState`] in the mapper's
//! registry. The record moves through these states:
//!
//! ```text
//!              register                    lock
//!  Unmapped ─────────────▶ MappedIdle ─────────────▶ MappedLocked / MappedWriteLocked
//!     ▲                     │      ▲                          │          │
//!     │        unregister   │      └──────── unlock ──────────┘          │ unregister
//!     ├─────────────────────┘          (last claim released)             ▼
//!     │                                                     UnregisteredPendingUnmap
//!     └──────────────────────── unlock (last claim released) ────────────┘
//! ```
//!
//! Transitions only update the record and report what the caller must do
//! next (for example "unmap now"); the mapper performs the backend calls.

use crate::backend::Mapping;
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Lock flags of a registered buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        /// The buffer is mapped and usable by new locks.
        const MAPPED = 1 << 0;
        /// At least one write claim is outstanding.
        const WRITE_LOCKED = 1 << 1;
        /// The buffer was unregistered; the unmap waits for the last claim.
        const UNREGISTERED = 1 << 2;
        /// At least one read claim is outstanding.
        const READ_LOCKED = 1 << 3;
    }
}

/// Requested CPU access for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl Access {
    /// Does this access write to the buffer?
    #[inline]
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Observable state of a buffer in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Not registered in this process.
    Unmapped,
    /// Registered, no outstanding claims.
    MappedIdle,
    /// Registered, read claims only.
    MappedLocked,
    /// Registered, at least one write claim.
    MappedWriteLocked,
    /// Unregistered while claimed; unmapped when the last claim is released.
    UnregisteredPendingUnmap,
}

/// Snapshot of a buffer's lock bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Current flags.
    pub flags: LockFlags,
    /// Outstanding read claims.
    pub readers: u32,
    /// Outstanding write claims.
    pub writers: u32,
    /// Process that created the mapping.
    pub owning_pid: u32,
}

/// Kind of claim released by an unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Read,
    Write,
}

/// What the mapper must do after an unregister transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnregisterStep {
    /// No claims outstanding: unmap and drop the record.
    UnmapNow,
    /// Claims outstanding: the last unlock unmaps.
    Defer,
}

/// Process-local bookkeeping for one registered buffer.
#[derive(Debug)]
pub(crate) struct BufferRuntimeState {
    /// Descriptor copy taken at registration.
    desc: BufferDescriptor,
    /// The local mapping, valid until the record is dropped.
    mapping: Mapping,
    flags: LockFlags,
    readers: u32,
    writers: u32,
    /// Claims taken off the counters by an unlock that has not finished yet.
    releasing: u32,
    owning_pid: u32,
}

impl BufferRuntimeState {
    /// Record a fresh registration.
    pub(crate) fn new(desc: BufferDescriptor, mapping: Mapping, owning_pid: u32) -> Self {
        Self {
            desc,
            mapping,
            flags: LockFlags::MAPPED,
            readers: 0,
            writers: 0,
            releasing: 0,
            owning_pid,
        }
    }

    pub(crate) fn desc(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub(crate) fn mapping(&self) -> Mapping {
        self.mapping
    }

    pub(crate) fn owning_pid(&self) -> u32 {
        self.owning_pid
    }

    /// The mapped base address, exposed only while MAPPED is set.
    pub(crate) fn mapped_base(&self) -> Option<std::ptr::NonNull<u8>> {
        self.flags
            .contains(LockFlags::MAPPED)
            .then(|| self.mapping.base())
    }

    /// Whether a write claim is outstanding.
    pub(crate) fn write_owner(&self) -> bool {
        self.writers > 0
    }

    pub(crate) fn is_pending_unmap(&self) -> bool {
        self.flags.contains(LockFlags::UNREGISTERED)
    }

    fn outstanding(&self) -> u32 {
        self.readers + self.writers + self.releasing
    }

    pub(crate) fn state(&self) -> BufferState {
        if self.is_pending_unmap() {
            BufferState::UnregisteredPendingUnmap
        } else if self.write_owner() {
            BufferState::MappedWriteLocked
        } else if self.readers > 0 {
            BufferState::MappedLocked
        } else {
            BufferState::MappedIdle
        }
    }

    pub(crate) fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            flags: self.flags,
            readers: self.readers,
            writers: self.writers,
            owning_pid: self.owning_pid,
        }
    }

    /// Take a claim. Fails without touching the record once unregistered.
    pub(crate) fn begin_lock(&mut self, access: Access) -> Result<()> {
        if self.is_pending_unmap() {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x} is unregistered",
                self.desc.id()
            )));
        }
        if access.writes() {
            self.writers += 1;
        } else {
            self.readers += 1;
        }
        self.refresh_flags();
        Ok(())
    }

    /// Undo a [`begin_lock`](Self::begin_lock) whose follow-up work failed.
    ///
    /// Returns true if the record must now be unmapped.
    pub(crate) fn cancel_lock(&mut self, access: Access) -> bool {
        if access.writes() {
            self.writers = self.writers.saturating_sub(1);
        } else {
            self.readers = self.readers.saturating_sub(1);
        }
        self.refresh_flags();
        self.should_unmap()
    }

    /// Start releasing the most privileged outstanding claim.
    pub(crate) fn begin_unlock(&mut self) -> Result<Claim> {
        let claim = if self.writers > 0 {
            self.writers -= 1;
            Claim::Write
        } else if self.readers > 0 {
            self.readers -= 1;
            Claim::Read
        } else {
            return Err(Error::InvalidHandle(format!(
                "buffer {:#x} is not locked",
                self.desc.id()
            )));
        };
        // The claim still pins the mapping until finish_unlock.
        self.releasing += 1;
        Ok(claim)
    }

    /// Finish an unlock started by [`begin_unlock`](Self::begin_unlock).
    ///
    /// Returns true if the record must now be unmapped.
    pub(crate) fn finish_unlock(&mut self) -> bool {
        self.releasing = self.releasing.saturating_sub(1);
        self.refresh_flags();
        self.should_unmap()
    }

    /// Logical unregister: clear MAPPED and decide whether to unmap now.
    pub(crate) fn unregister(&mut self) -> UnregisterStep {
        self.flags.remove(LockFlags::MAPPED);
        if self.outstanding() == 0 {
            UnregisterStep::UnmapNow
        } else {
            self.flags.insert(LockFlags::UNREGISTERED);
            UnregisterStep::Defer
        }
    }

    fn should_unmap(&self) -> bool {
        self.is_pending_unmap() && self.outstanding() == 0
    }

    fn refresh_flags(&mut self) {
        self.flags.set(LockFlags::WRITE_LOCKED, self.writers > 0);
        self.flags.set(LockFlags::READ_LOCKED, self.readers > 0);
    }
}
