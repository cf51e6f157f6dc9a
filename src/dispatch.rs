//! Per-adapter SCO dispatcher.
//!
//! Voice links are initiated by the kernel on behalf of the remote device;
//! the dispatcher listens on a per-adapter SCO socket with deferred setup,
//! correlates every accepted link to its transport and installs the socket
//! there before starting the IO workers.

use libc::{AF_BLUETOOTH, SOCK_SEQPACKET};
use std::{
    io::ErrorKind as IoErrorKind,
    os::unix::io::AsRawFd,
    sync::{Arc, Weak},
    thread::JoinHandle,
};

use crate::{
    hci,
    sock::{self, OwnedFd, SysSockAddr},
    sys,
    thread::ThreadState,
    transport::{BtAcquired, CodecId, Transport},
    Adapter, Address, Error, ErrorKind, Result,
};

/// SCO socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr {
    /// Device address.
    pub addr: Address,
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sys::sockaddr_sco;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sys::sockaddr_sco { sco_family: AF_BLUETOOTH as _, sco_bdaddr: self.addr.into() }
    }

    fn try_from_sys_sock_addr(saddr: Self::SysSockAddr) -> std::io::Result<Self> {
        if saddr.sco_family != AF_BLUETOOTH as _ {
            return Err(std::io::Error::new(
                IoErrorKind::InvalidInput,
                "sockaddr_sco::sco_family is not AF_BLUETOOTH",
            ));
        }
        Ok(Self { addr: Address::from(saddr.sco_bdaddr) })
    }
}

/// Configure the socket voice mode for the given link codec.
///
/// Transparent data is a prerequisite for mSBC and LC3-SWB and must be in
/// place before any data crosses the socket.
fn set_voice(fd: &OwnedFd, codec: CodecId) -> std::io::Result<()> {
    let setting = match codec {
        CodecId::Msbc | CodecId::Lc3Swb => sys::BT_VOICE_TRANSPARENT,
        _ => sys::BT_VOICE_CVSD_16BIT,
    };
    let voice = sys::bt_voice { setting };
    sock::setsockopt(fd, libc::SOL_BLUETOOTH, sys::BT_VOICE, &voice)
}

/// Effective read/write MTU of a SCO socket.
///
/// The kernel-reported value is usable on UART controllers; USB controllers
/// transfer SCO in fixed-size isochronous frames, so the usable MTU is
/// dictated by the transfer size instead.
fn sco_mtu(adapter: &Adapter, codec: CodecId, kernel_mtu: usize) -> (usize, usize) {
    let is_realtek = adapter.chip().map(|c| c.is_realtek()).unwrap_or(false);
    sco_mtu_quirk(adapter.is_usb(), is_realtek, codec, kernel_mtu)
}

fn sco_mtu_quirk(is_usb: bool, is_realtek: bool, codec: CodecId, kernel_mtu: usize) -> (usize, usize) {
    if !is_usb {
        return (kernel_mtu, kernel_mtu);
    }
    match codec {
        CodecId::Cvsd => (24, 48),
        _ if is_realtek => (72, 72),
        _ => (24, 24),
    }
}

fn sco_socket(adapter: &Adapter) -> Result<OwnedFd> {
    let fd = sock::socket(AF_BLUETOOTH, SOCK_SEQPACKET, sys::BTPROTO_SCO)?;
    let info = hci::dev_info(adapter.index())?;
    sock::bind(&fd, SocketAddr { addr: Address::from(info.bdaddr) })?;
    Ok(fd)
}

/// Open, configure and connect an outgoing SCO link.
///
/// Used by gateway transports which initiate the audio connection.
pub fn sco_connect(adapter: &Adapter, peer: Address, codec: CodecId) -> Result<BtAcquired> {
    let fd = sco_socket(adapter)?;
    set_voice(&fd, codec)?;
    match sock::connect(&fd, SocketAddr { addr: peer }) {
        Ok(()) => (),
        Err(err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.raw_os_error() == Some(libc::EAGAIN) =>
        {
            let mut fds = [libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLOUT, revents: 0 }];
            if sock::poll(&mut fds, Some(crate::TIMEOUT))? == 0 {
                return Err(Error::new(ErrorKind::TimedOut));
            }
            let err: libc::c_int = sock::getsockopt(&fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
            if err != 0 {
                return Err(std::io::Error::from_raw_os_error(err).into());
            }
        }
        Err(err) => return Err(err.into()),
    }
    let options: sys::sco_options = sock::getsockopt(&fd, sys::SOL_SCO, sys::SCO_OPTIONS)?;
    let (mtu_read, mtu_write) = sco_mtu(adapter, codec, options.mtu as usize);
    Ok(BtAcquired { fd, mtu_read, mtu_write })
}

/// Listening SCO dispatcher of one adapter.
pub struct ScoDispatcher {
    shutdown: OwnedFd,
    join: Option<JoinHandle<()>>,
}

impl ScoDispatcher {
    /// Open the listening socket and start the dispatcher thread.
    pub(crate) fn start(adapter: &Arc<Adapter>) -> Result<Self> {
        let fd = sco_socket(adapter)?;

        // Broadcom routes SCO to its PCM pins by default; force the
        // transport route so the audio reaches the host.
        if adapter.chip().map(|c| c.is_broadcom()).unwrap_or(false) {
            if let Err(err) = hci::bcm_sco_route_to_transport(adapter.index()) {
                log::warn!("{}: Broadcom SCO routing: {}", adapter.name(), err);
            }
        }

        // Deferred setup: the kernel must not negotiate the voice mode
        // before we had a chance to select it for the negotiated codec.
        let defer: libc::c_int = 1;
        sock::setsockopt(&fd, libc::SOL_BLUETOOTH, sys::BT_DEFER_SETUP, &defer)?;
        sock::listen(&fd, 10)?;

        let shutdown = sock::eventfd()?;
        let shutdown_fd = shutdown.duplicate()?;
        let weak = Arc::downgrade(adapter);
        let name = adapter.name().to_string();
        let join = std::thread::Builder::new()
            .name("ba-sco".into())
            .spawn(move || dispatcher_loop(weak, name, fd, shutdown_fd))
            .map_err(Error::from)?;
        log::debug!("{}: SCO dispatcher started", adapter.name());
        Ok(Self { shutdown, join: Some(join) })
    }
}

impl Drop for ScoDispatcher {
    fn drop(&mut self) {
        let _ = sock::write(self.shutdown.as_raw_fd(), &1u64.to_ne_bytes());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn dispatcher_loop(adapter: Weak<Adapter>, name: String, fd: OwnedFd, shutdown: OwnedFd) {
    loop {
        let mut fds = [sock::poll_in(shutdown.as_raw_fd()), sock::poll_in(fd.as_raw_fd())];
        match sock::poll(&mut fds, None) {
            Ok(_) => (),
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("{name}: SCO dispatcher poll: {err}");
                break;
            }
        }
        if fds[0].revents != 0 {
            break;
        }
        let (link, peer) = match sock::accept::<SocketAddr>(&fd) {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == IoErrorKind::WouldBlock => continue,
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("{name}: SCO accept: {err}");
                continue;
            }
        };
        let Some(adapter) = adapter.upgrade() else { break };
        if let Err(err) = dispatch_link(&adapter, link, peer.addr) {
            log::warn!("{name}: SCO link from {}: {}", peer.addr, err);
        }
    }
    log::debug!("{name}: SCO dispatcher terminated");
}

/// Glue one accepted kernel SCO link to its transport.
fn dispatch_link(adapter: &Arc<Adapter>, link: OwnedFd, peer: Address) -> Result<()> {
    let device = adapter.device(peer).ok_or_else(|| Error::new(ErrorKind::NotFound))?;
    let transport: Arc<Transport> =
        device.sco_transport().ok_or_else(|| Error::new(ErrorKind::NotFound))?;
    let codec = transport.codec();
    log::debug!("{}: incoming SCO link ({})", transport.path(), codec);

    // Transparent voice must be configured before the authorizing read.
    set_voice(&link, codec)?;
    match sock::read(link.as_raw_fd(), &mut []) {
        Ok(_) => (),
        Err(err) if err.kind() == IoErrorKind::WouldBlock => (),
        Err(err) => return Err(err.into()),
    }

    // The codec may have changed since the previous link; old workers are
    // of no use for the new socket.
    transport.stop();

    let options: sys::sco_options = sock::getsockopt(&link, sys::SOL_SCO, sys::SCO_OPTIONS)?;
    let (mtu_read, mtu_write) = sco_mtu(adapter, codec, options.mtu as usize);
    transport.install_bt(BtAcquired { fd: link, mtu_read, mtu_write })?;

    for thread in [transport.thread_enc(), transport.thread_dec()] {
        let _ = thread.state_set(ThreadState::Idle);
    }
    transport.start()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_mtu_overrides() {
        assert_eq!(sco_mtu_quirk(true, false, CodecId::Cvsd, 60), (24, 48));
        assert_eq!(sco_mtu_quirk(true, false, CodecId::Msbc, 60), (24, 24));
        assert_eq!(sco_mtu_quirk(true, false, CodecId::Lc3Swb, 60), (24, 24));
        assert_eq!(sco_mtu_quirk(true, true, CodecId::Msbc, 60), (72, 72));
    }

    #[test]
    fn uart_mtu_is_kernel_reported() {
        assert_eq!(sco_mtu_quirk(false, false, CodecId::Cvsd, 60), (60, 60));
        assert_eq!(sco_mtu_quirk(false, true, CodecId::Msbc, 48), (48, 48));
    }
}
