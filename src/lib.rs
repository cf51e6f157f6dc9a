//! # BlueALSA — Bluetooth audio transport runtime
//!
//! This library bridges Bluetooth audio profiles (A2DP for media, HFP/HSP for
//! telephony) between the Linux Bluetooth daemon (BlueZ) and local audio
//! clients that expect FIFO-like PCM endpoints.
//!
//! The process owns several Bluetooth transports concurrently. Each transport
//! carries its own negotiated codec, a pair of audio worker threads, its own
//! volume state and a lifecycle driven by events from the local clients below
//! and from BlueZ above.
//!
//! The following functionality is provided.
//!
//! * [Adapters](Adapter) — one per HCI controller, owning the
//!   [SCO dispatcher](dispatch).
//! * [Devices](Device) — one per remote address, owning its transports.
//! * [Transports](transport::Transport) — one per BlueZ media transport or
//!   SCO link, owning two [PCM endpoints](pcm::TransportPcm), two
//!   [IO worker threads](thread::IoThread) and a
//!   [supervisor thread](manager::ThreadManager).
//! * The `org.bluealsa` D-Bus service: PCM objects with `Open`,
//!   `SelectCodec` and `GetCodecs`, a manager object with `GetPCMs` and
//!   RFCOMM objects for external AT handlers.
//! * [Multi-client mixing](mix::MixBuffer) for shared playback transports.
//!
//! This library depends on the [tokio] asynchronous runtime for its D-Bus
//! front end; the audio path itself runs on plain OS threads.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("BlueALSA only supports the Linux operating system.");

use dbus::arg::AppendAll;
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use macaddr::MacAddr6;
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::EnumString;

/// D-Bus service name under which the PCM objects are published.
pub(crate) const SERVICE_NAME: &str = "org.bluealsa";
/// Root path of all published objects.
pub(crate) const SERVICE_PATH: &str = "/org/bluealsa";
/// D-Bus service name of the Bluetooth daemon.
pub(crate) const BLUEZ_SERVICE: &str = "org.bluez";
/// Error prefix of our D-Bus error replies.
pub(crate) const ERR_PREFIX: &str = "org.bluealsa.Error.";
/// Timeout for D-Bus method calls towards BlueZ.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(30);

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

mod adapter;
pub mod codec;
pub mod config;
mod device;
pub mod dispatch;
pub mod dump;
pub mod hci;
pub mod manager;
pub mod mix;
pub mod multi;
pub mod pcm;
mod rpc;
mod session;
mod sock;
pub mod storage;
mod sys;
pub mod thread;
pub mod transport;
pub mod volume;

pub use crate::{adapter::*, config::Config, device::*, session::*, sock::OwnedFd};

/// Bluetooth audio error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth audio error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// operation would block
    WouldBlock,
    /// interrupted system call
    Interrupted,
    /// device or resource busy
    Busy,
    /// illegal state transition
    InvalidState,
    /// operation not supported
    NotSupported,
    /// operation timed out
    TimedOut,
    /// no such worker thread
    NoSuchThread,
    /// stale PCM data
    Stale,
    /// transport is not acquired
    NotAcquired,
    /// transport is stopping
    Stopping,
    /// the target object was either not present or removed
    #[strum(disabled)]
    NotFound,
    /// operation failed
    Failed,
    /// invalid arguments
    InvalidArguments,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind.
///
/// This is most likely caused by incompatibilities between this library
/// and the version of the Bluetooth daemon.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
            message: err.message().unwrap_or_default().to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal(InternalErrorKind::Io(err.kind())),
        };
        Self { kind, message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as E;
        let kind = match err.kind {
            ErrorKind::WouldBlock => E::WouldBlock,
            ErrorKind::Interrupted => E::Interrupted,
            ErrorKind::Busy => E::Other,
            ErrorKind::InvalidState => E::InvalidInput,
            ErrorKind::NotSupported => E::Unsupported,
            ErrorKind::TimedOut => E::TimedOut,
            ErrorKind::NoSuchThread => E::NotFound,
            ErrorKind::Stale => E::InvalidData,
            ErrorKind::NotAcquired => E::NotConnected,
            ErrorKind::Stopping => E::Other,
            ErrorKind::NotFound => E::NotFound,
            ErrorKind::Failed => E::Other,
            ErrorKind::InvalidArguments => E::InvalidInput,
            ErrorKind::InvalidAddress(_) => E::InvalidInput,
            ErrorKind::Internal(InternalErrorKind::Io(kind)) => kind,
            ErrorKind::Internal(_) => E::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Bluetooth audio result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// Underscore-separated form used in D-Bus object paths.
    pub fn to_path_component(self) -> String {
        format!(
            "{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// A property change reported by the core to the D-Bus front end.
#[derive(Debug, Clone)]
pub(crate) enum PcmProperty {
    /// The worker thread entered or left the Running state.
    Running(bool),
    /// The negotiated codec changed.
    Codec(String),
    /// Stream format id changed (HFP codec selection changes it).
    Format(u16),
    /// Channel count changed.
    Channels(u8),
    /// Sampling rate changed.
    Rate(u32),
    /// Delay changed (tenths of a millisecond).
    Delay(u16),
    /// Client delay adjustment changed.
    ClientDelay(i16),
    /// Soft-volume flag changed.
    SoftVolume(bool),
    /// Per-channel wire volume (level byte with mute in the MSB).
    Volume(Vec<u8>),
}

/// A property change on an RFCOMM object.
#[derive(Debug, Clone)]
pub(crate) enum RfcommProperty {
    /// Battery level in percent, `-1` when unknown.
    Battery(i8),
}

/// Event fan-out from the core threads to the D-Bus front end.
#[derive(Debug)]
pub(crate) enum BaEvent {
    /// PCM object property changed.
    PcmPropertyChanged { path: String, property: PcmProperty },
    /// RFCOMM object property changed.
    RfcommPropertyChanged { path: String, property: RfcommProperty },
}

/// Sender half of the core event channel.
///
/// Cheap to clone; worker threads push property notifications through it
/// without touching any D-Bus state. With no front end attached the
/// events are simply dropped.
pub(crate) type EventSender = tokio::sync::mpsc::UnboundedSender<BaEvent>;

pub(crate) fn null_events() -> EventSender {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    tx
}

/// Result of calling one of our D-Bus methods.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Call method on Arc D-Bus object we are serving.
pub(crate) fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_display_round_trip() {
        let addr: Address = "12:34:56:78:9A:BC".parse().unwrap();
        assert_eq!(addr, Address::new([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]));
        assert_eq!(addr.to_string(), "12:34:56:78:9A:BC");
        assert_eq!(addr.to_path_component(), "12_34_56_78_9A_BC");
    }

    #[test]
    fn address_bdaddr_reversal() {
        let addr: Address = "12:34:56:78:9A:BC".parse().unwrap();
        let raw: sys::bdaddr_t = addr.into();
        assert_eq!(raw.b, [0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Address::from(raw), addr);
    }
}
