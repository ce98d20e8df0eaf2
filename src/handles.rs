//! # Handle Table
//!
//! Tracks OS file handles attached to an in-flight message. On intern every
//! caller-supplied descriptor is borrowed by duplicating it, so the backing
//! kernel object stays alive no matter what the sender does afterwards. On
//! delivery each borrow is duplicated once more into a fresh, receiver-owned
//! descriptor; the borrows themselves die with the message.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::trace;

use crate::error::{Error, Result};

fn dup_cloexec(fd: RawFd) -> Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(Error::BadHandle);
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Borrowed descriptors held for one message.
#[derive(Debug)]
pub struct HandleTable {
    borrowed: Vec<OwnedFd>,
}

impl HandleTable {
    /// Borrow every descriptor in `fds`. If any of them is invalid, all
    /// borrows taken so far are released, last to first, and the sender
    /// keeps sole ownership of its originals.
    pub fn intern(fds: &[RawFd]) -> Result<Self> {
        let mut borrowed: Vec<OwnedFd> = Vec::with_capacity(fds.len());
        for &fd in fds {
            match dup_cloexec(fd) {
                Ok(owned) => borrowed.push(owned),
                Err(err) => {
                    while let Some(taken) = borrowed.pop() {
                        drop(taken);
                    }
                    return Err(err);
                }
            }
        }
        trace!(count = borrowed.len(), "interned handle array");
        Ok(Self { borrowed })
    }

    pub fn len(&self) -> usize {
        self.borrowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.borrowed.is_empty()
    }

    /// Create a fresh receiver-visible duplicate of every borrow. On
    /// failure the partial set is closed, last to first, and the borrows
    /// stay untouched for a later delivery attempt.
    pub fn install(&self) -> Result<Vec<OwnedFd>> {
        let mut installed: Vec<OwnedFd> = Vec::with_capacity(self.borrowed.len());
        for fd in &self.borrowed {
            match dup_cloexec(fd.as_raw_fd()) {
                Ok(owned) => installed.push(owned),
                Err(err) => {
                    while let Some(taken) = installed.pop() {
                        drop(taken);
                    }
                    return Err(err);
                }
            }
        }
        Ok(installed)
    }
}
