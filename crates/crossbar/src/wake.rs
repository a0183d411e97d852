use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use mio::{Interest, Registry, Token, unix::SourceFd};
use tracing::error;

/// Self-pipe used to wake the IO loop from other threads.
///
/// Every cross-thread enqueue writes exactly one byte; the IO loop performs
/// one queue pop per byte it drains. Both ends are non-blocking so a notify
/// can never stall a caller.
pub(crate) struct WakePipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking_cloexec(rx.as_raw_fd())?;
        set_nonblocking_cloexec(tx.as_raw_fd())?;
        Ok(Self { rx, tx })
    }

    /// One byte per enqueued item.
    pub fn notify(&self) {
        let n = unsafe { libc::write(self.tx.as_raw_fd(), [b' '].as_ptr().cast(), 1) };
        if n != 1 {
            error!("wake pipe write returned {n}");
        }
    }

    /// Drains pending wake bytes in bursts, returning how many were consumed.
    pub fn drain(&self, scratch: &mut [u8]) -> usize {
        let mut total = 0;
        loop {
            let n = unsafe {
                libc::read(self.rx.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len())
            };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => {}
                _ => {
                    error!(%err, "wake pipe read failed");
                    break;
                }
            }
        }
        total
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.rx.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        let fd = self.rx.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
