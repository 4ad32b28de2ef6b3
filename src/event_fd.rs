//! Thin eventfd wrapper used to wake a thread blocked in
//! [`Transport::readable_or_event`](crate::transport::Transport::readable_or_event).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{NetError, Result};

/// A Linux eventfd.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create an eventfd with an initial count of zero.
    pub fn new() -> Result<Self> {
        // SAFETY: eventfd returns a fresh fd or -1; ownership transfers to
        // the OwnedFd on success.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Signal the event, waking any poller.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        // SAFETY: val lives across the call and eventfd writes are exactly
        // 8 bytes.
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc != 8 {
            return Err(NetError::last_os_error());
        }
        Ok(())
    }

    /// Consume the pending count, rearming the event. Returns the count.
    pub fn clear(&self) -> Result<u64> {
        let mut val: u64 = 0;
        // SAFETY: val lives across the call and eventfd reads are exactly
        // 8 bytes.
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if rc != 8 {
            return Err(NetError::last_os_error());
        }
        Ok(val)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
