//! Passing buffer descriptors between processes.
//!
//! Descriptors travel over Unix domain sockets. The payload is the
//! descriptor's wire encoding; for fd-backed buffers the region's file
//! descriptor rides along as an `SCM_RIGHTS` ancillary message, and the
//! receiver's copy of the descriptor is rewritten to name the received fd.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::os::unix::net::UnixStream;
//! use gralloc_mapper::transport::{recv_descriptor, send_descriptor};
//!
//! let (producer, consumer) = UnixStream::pair()?;
//! send_descriptor(&producer, &desc)?;
//!
//! let received = recv_descriptor(&consumer)?;
//! mapper.register(received.descriptor())?;
//! ```

use crate::backend::BackendKind;
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Upper bound on an encoded descriptor.
const MAX_WIRE_LEN: usize = 256;

/// A descriptor received from another process.
///
/// For fd-backed buffers this owns the received file descriptor, and the
/// descriptor refers to it. Keep it alive until the buffer is registered;
/// the mapping stays valid after the fd is closed.
#[derive(Debug)]
pub struct ReceivedDescriptor {
    descriptor: BufferDescriptor,
    fd: Option<OwnedFd>,
}

impl ReceivedDescriptor {
    /// The descriptor, valid in this process.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// The received file descriptor, for fd-backed buffers.
    pub fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    /// Split into the descriptor and the fd it refers to.
    pub fn into_parts(self) -> (BufferDescriptor, Option<OwnedFd>) {
        (self.descriptor, self.fd)
    }
}

/// Length of every encoded descriptor.
fn wire_len() -> Result<usize> {
    let len = BufferDescriptor::with_secure_id(0, 0, 1).encode()?.len();
    if len > MAX_WIRE_LEN {
        return Err(Error::ValidationFailed(format!(
            "descriptor encoding is {len} bytes, limit {MAX_WIRE_LEN}"
        )));
    }
    Ok(len)
}

/// Send `desc` over `socket`.
///
/// # Errors
///
/// Returns [`Error::InvalidHandle`] if the descriptor is malformed, or a
/// system error if the send fails.
pub fn send_descriptor(socket: &UnixStream, desc: &BufferDescriptor) -> Result<()> {
    desc.validate()?;
    let payload = desc.encode()?;

    let share_fds: Vec<BorrowedFd<'_>> = if desc.backend()? == BackendKind::Fd {
        // SAFETY: validate() checked the fd is non-negative; the caller
        // keeps it open for the duration of the call.
        vec![unsafe { BorrowedFd::borrow_raw(desc.share_fd()) }]
    } else {
        Vec::new()
    };

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !share_fds.is_empty() && !ancillary.push(SendAncillaryMessage::ScmRights(&share_fds)) {
        return Err(Error::InvalidHandle(format!(
            "buffer {:#x}: failed to attach share fd",
            desc.id()
        )));
    }

    let iov = [IoSlice::new(&payload)];
    let sent = sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    if sent != payload.len() {
        // The fd went out with the first byte; finish the payload.
        let mut stream = socket;
        stream.write_all(&payload[sent..])?;
    }

    tracing::trace!(id = desc.id(), bytes = payload.len(), "sent descriptor");
    Ok(())
}

/// Receive a descriptor sent with [`send_descriptor`].
///
/// # Errors
///
/// - [`Error::Io`] if the peer closed the socket
/// - [`Error::ValidationFailed`] if the payload is not a descriptor
/// - [`Error::InvalidHandle`] if the descriptor is malformed or the number
///   of received fds does not match its backend
pub fn recv_descriptor(socket: &UnixStream) -> Result<ReceivedDescriptor> {
    let len = wire_len()?;
    let mut buf = [0u8; MAX_WIRE_LEN];

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(&mut buf[..len])];
    let received = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;
    if received.bytes == 0 {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    if received.bytes < len {
        let mut stream = socket;
        stream.read_exact(&mut buf[received.bytes..len])?;
    }

    let descriptor = BufferDescriptor::decode(&buf[..len])?;

    match (descriptor.backend()?, fds.len()) {
        (BackendKind::Fd, 1) => {
            let fd = fds.pop();
            let local = fd.as_ref().map_or(-1, AsRawFd::as_raw_fd);
            tracing::trace!(id = descriptor.id(), fd = local, "received fd descriptor");
            Ok(ReceivedDescriptor {
                descriptor: descriptor.with_share_fd(local),
                fd,
            })
        }
        (BackendKind::SecureId, 0) => {
            tracing::trace!(id = descriptor.id(), "received secure id descriptor");
            Ok(ReceivedDescriptor {
                descriptor,
                fd: None,
            })
        }
        (backend, count) => Err(Error::InvalidHandle(format!(
            "buffer {:#x}: {backend} descriptor arrived with {count} fds",
            descriptor.id()
        ))),
    }
}
