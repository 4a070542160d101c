//! Nonblocking byte endpoints backing local streams.
//!
//! A local stream does not care where its bytes come from: an accepted
//! client connection, a service's socketpair end, or a test double. The
//! [`Endpoint`] trait is that seam. The fd-backed implementation uses raw
//! nonblocking `read(2)`/`write(2)`; `EAGAIN` surfaces as
//! `io::ErrorKind::WouldBlock`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A nonblocking bidirectional byte channel.
pub trait Endpoint {
    /// Read into `buf`. `Ok(0)` is end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`. `Ok(0)` is treated as a hard error by callers.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// The descriptor to register with the event loop. Fake endpoints
    /// return a synthetic token; it only needs to be unique per endpoint.
    fn raw_fd(&self) -> RawFd;
}

/// An [`Endpoint`] over an owned file descriptor.
///
/// Dropping it closes the fd; the event-loop registration must be removed
/// first (the mux guarantees that ordering on destruction).
pub struct FdEndpoint {
    fd: OwnedFd,
}

impl FdEndpoint {
    /// Wrap an owned descriptor, switching it to nonblocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// Wrap a raw descriptor.
    ///
    /// # Safety
    ///
    /// The fd must be valid, open, and owned by the caller.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        Self::new(OwnedFd::from_raw_fd(fd))
    }
}

impl Endpoint for FdEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd.as_raw_fd();
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.fd.as_raw_fd();
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Create a connected pair of nonblocking stream endpoints.
///
/// Handy for wiring an in-process service to a local stream: hand one end
/// to the mux, keep the other in the service task.
pub fn endpoint_pair() -> io::Result<(FdEndpoint, FdEndpoint)> {
    let mut fds = [0i32; 2];

    #[cfg(target_os = "linux")]
    let sock_type = libc::SOCK_STREAM | libc::SOCK_NONBLOCK;
    #[cfg(not(target_os = "linux"))]
    let sock_type = libc::SOCK_STREAM;

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((FdEndpoint::new(a)?, FdEndpoint::new(b)?))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_moves_bytes_both_ways() {
        let (mut a, mut b) = endpoint_pair().expect("socketpair");
        assert_eq!(a.write(b"ping").expect("write"), 4);
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"ping");

        assert_eq!(b.write(b"pong").expect("write"), 4);
        assert_eq!(a.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn empty_pair_read_would_block() {
        let (mut a, _b) = endpoint_pair().expect("socketpair");
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).expect_err("nothing to read");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_after_peer_drop_is_eof() {
        let (mut a, b) = endpoint_pair().expect("socketpair");
        drop(b);
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).expect("eof read"), 0);
    }
}
