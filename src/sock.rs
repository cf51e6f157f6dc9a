//! System socket base.

use libc::{
    c_int, c_ulong, nfds_t, pollfd, sockaddr, socklen_t, AF_LOCAL, F_DUPFD_CLOEXEC, F_GETFL, F_SETFL,
    O_CLOEXEC, O_NONBLOCK, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_SEQPACKET,
};
use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    time::Duration,
};

/// File descriptor that is closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
    close_on_drop: bool,
}

impl OwnedFd {
    /// Create new OwnedFd taking ownership of file descriptor.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self { fd, close_on_drop: true }
    }

    /// Duplicate the file descriptor with `F_DUPFD_CLOEXEC`.
    pub fn duplicate(&self) -> Result<OwnedFd> {
        match unsafe { libc::fcntl(self.fd, F_DUPFD_CLOEXEC, 0) } {
            -1 => Err(Error::last_os_error()),
            fd => Ok(unsafe { OwnedFd::new(fd) }),
        }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(mut self) -> RawFd {
        self.close_on_drop = false;
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if self.close_on_drop {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Address that is convertible to and from a system socket address.
pub trait SysSockAddr: Sized {
    /// System socket address type.
    type SysSockAddr: Sized + 'static;

    /// Convert to system socket address.
    fn into_sys_sock_addr(self) -> Self::SysSockAddr;

    /// Convert from system socket address.
    fn try_from_sys_sock_addr(addr: Self::SysSockAddr) -> Result<Self>;
}

/// Creates a socket of the specified type and returns its file descriptor.
///
/// The socket is set to non-blocking mode.
pub fn socket(sa: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd> {
    let fd = match unsafe { libc::socket(sa, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, proto) } {
        -1 => return Err(Error::last_os_error()),
        fd => unsafe { OwnedFd::new(fd) },
    };
    Ok(fd)
}

/// Binds socket to specified address.
pub fn bind<SA>(socket: &OwnedFd, sa: SA) -> Result<()>
where
    SA: SysSockAddr,
{
    let addr: SA::SysSockAddr = sa.into_sys_sock_addr();
    if unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Puts socket in listen mode.
pub fn listen(socket: &OwnedFd, backlog: i32) -> Result<()> {
    if unsafe { libc::listen(socket.as_raw_fd(), backlog) } == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Accept a connection on the provided socket.
///
/// The accepted socket is set into non-blocking mode.
pub fn accept<SA>(socket: &OwnedFd) -> Result<(OwnedFd, SA)>
where
    SA: SysSockAddr,
{
    let mut saddr: MaybeUninit<SA::SysSockAddr> = MaybeUninit::uninit();
    let mut length = size_of::<SA::SysSockAddr>() as socklen_t;

    let fd = match unsafe {
        libc::accept4(socket.as_raw_fd(), saddr.as_mut_ptr() as *mut _, &mut length, SOCK_CLOEXEC | SOCK_NONBLOCK)
    } {
        -1 => return Err(Error::last_os_error()),
        fd => unsafe { OwnedFd::new(fd) },
    };

    if length != size_of::<SA::SysSockAddr>() as socklen_t {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid sockaddr length"));
    }
    let saddr = unsafe { saddr.assume_init() };
    let sa = SA::try_from_sys_sock_addr(saddr)?;

    Ok((fd, sa))
}

/// Initiate a connection on a socket to the specified address.
pub fn connect<SA>(socket: &OwnedFd, sa: SA) -> Result<()>
where
    SA: SysSockAddr,
{
    let addr: SA::SysSockAddr = sa.into_sys_sock_addr();
    if unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Read from file descriptor into buffer.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    match unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Write buffer to file descriptor.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    match unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Get socket option.
pub fn getsockopt<T>(socket: &OwnedFd, level: c_int, optname: c_int) -> Result<T> {
    let mut optval: MaybeUninit<T> = MaybeUninit::uninit();
    let mut optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::getsockopt(socket.as_raw_fd(), level, optname, optval.as_mut_ptr() as *mut _, &mut optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    if optlen != size_of::<T>() as _ {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid size"));
    }
    let optval = unsafe { optval.assume_init() };
    Ok(optval)
}

/// Set socket option.
pub fn setsockopt<T>(socket: &OwnedFd, level: c_int, optname: i32, optval: &T) -> Result<()> {
    let optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::setsockopt(socket.as_raw_fd(), level, optname, optval as *const _ as *const _, optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Perform an IOCTL that reads a single value.
pub fn ioctl_read<T>(socket: &OwnedFd, request: c_ulong) -> Result<T> {
    let mut value: MaybeUninit<T> = MaybeUninit::uninit();
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), request, value.as_mut_ptr()) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    let value = unsafe { value.assume_init() };
    Ok(value)
}

/// Set or clear `O_NONBLOCK` on a file descriptor.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, F_GETFL, 0) };
    if flags == -1 {
        return Err(Error::last_os_error());
    }
    let flags = if nonblocking { flags | O_NONBLOCK } else { flags & !O_NONBLOCK };
    if unsafe { libc::fcntl(fd, F_SETFL, flags) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Create a unidirectional pipe; returns (read end, write end).
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    if unsafe { libc::pipe2(&mut fds as *mut c_int, O_CLOEXEC) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::new(fds[0]) }, unsafe { OwnedFd::new(fds[1]) }))
}

/// Create a connected `SOCK_SEQPACKET` socket pair.
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut sv: [RawFd; 2] = [0; 2];
    if unsafe { libc::socketpair(AF_LOCAL, SOCK_SEQPACKET | SOCK_CLOEXEC, 0, &mut sv as *mut c_int) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::new(sv[0]) }, unsafe { OwnedFd::new(sv[1]) }))
}

/// Create an event file descriptor for cross-thread wake-ups.
pub fn eventfd() -> Result<OwnedFd> {
    match unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::new(fd) }),
    }
}

/// Poll the given descriptors for input readiness.
///
/// Returns the number of ready descriptors, `0` on timeout. `EINTR` is
/// reported to the caller, which re-arms with a recomputed deadline.
pub fn poll(fds: &mut [pollfd], timeout: Option<Duration>) -> Result<usize> {
    let millis: c_int = match timeout {
        Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
        None => -1,
    };
    match unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, millis) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Build a `pollfd` entry waiting for input.
pub fn poll_in(fd: RawFd) -> pollfd {
    pollfd { fd, events: libc::POLLIN, revents: 0 }
}
