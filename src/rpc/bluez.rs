//! Callbacks bridging the core to the `org.bluez.MediaTransport1` objects.
//!
//! The core's acquire and release paths are synchronous; the proxies here
//! block on the D-Bus futures, which the connection task keeps driving on
//! the tokio runtime.

use dbus::{
    nonblock::{stdintf::org_freedesktop_dbus::Properties, Proxy, SyncConnection},
    Path,
};
use futures::executor::block_on;
use std::{os::unix::io::AsRawFd, sync::Arc};

use crate::{
    sock,
    transport::{AcquireFn, AcquireKind, BtAcquired, ReleaseFn, RemoteVolumeFn},
    Error, Result, BLUEZ_SERVICE, TIMEOUT,
};

pub(crate) const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";

fn proxy<'a>(connection: &'a SyncConnection, path: &str) -> Result<Proxy<'a, &'a SyncConnection>> {
    let path = Path::new(path.to_string()).map_err(|_| Error::new(crate::ErrorKind::InvalidArguments))?;
    Ok(Proxy::new(BLUEZ_SERVICE, path, TIMEOUT, connection))
}

/// Acquisition callback calling `Acquire` or `TryAcquire` on the daemon.
pub(crate) fn acquire_fn(connection: Arc<SyncConnection>, path: String) -> AcquireFn {
    Box::new(move |kind| {
        let method = match kind {
            AcquireKind::Try => "TryAcquire",
            AcquireKind::Normal => "Acquire",
        };
        log::trace!("{}: {}.{}", path, MEDIA_TRANSPORT_INTERFACE, method);
        let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) =
            block_on(proxy(&connection, &path)?.method_call(MEDIA_TRANSPORT_INTERFACE, method, ()))
                .map_err(Error::from)?;
        let fd = unsafe { sock::OwnedFd::new(fd.into_fd()) };
        sock::set_nonblocking(fd.as_raw_fd(), true)?;
        Ok(BtAcquired { fd, mtu_read: mtu_read as usize, mtu_write: mtu_write as usize })
    })
}

/// Release callback calling `Release` on the daemon.
pub(crate) fn release_fn(connection: Arc<SyncConnection>, path: String) -> ReleaseFn {
    Box::new(move || {
        log::trace!("{}: {}.Release", path, MEDIA_TRANSPORT_INTERFACE);
        block_on(proxy(&connection, &path)?.method_call(MEDIA_TRANSPORT_INTERFACE, "Release", ()))
            .map_err(Error::from)
    })
}

/// Remote volume delegation: a property write of the AVRCP absolute volume.
pub(crate) fn volume_fn(connection: Arc<SyncConnection>, path: String) -> RemoteVolumeFn {
    Box::new(move |pcm| {
        let volume = pcm.volume()[0];
        let value = crate::volume::level_to_range(volume.level(), crate::volume::RANGE_MAX_A2DP) as u16;
        log::trace!("{}: {}.Volume := {}", path, MEDIA_TRANSPORT_INTERFACE, value);
        block_on(proxy(&connection, &path)?.set(MEDIA_TRANSPORT_INTERFACE, "Volume", value))
            .map_err(Error::from)
    })
}
