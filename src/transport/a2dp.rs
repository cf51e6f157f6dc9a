//! A2DP media transport state and the acquire/release protocol.

use std::{
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicI32, AtomicU16, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};
use strum::{Display, EnumString};

use crate::{
    codec::A2dpCodecInfo,
    transport::{BtAcquired, Transport, TransportData},
    Error, ErrorKind, InternalErrorKind, Result,
};

/// Transport state as reported by the Bluetooth daemon.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, EnumString)]
pub enum A2dpState {
    /// Streaming suspended, socket torn down on the daemon side.
    #[strum(serialize = "idle")]
    Idle,
    /// The remote requested streaming; waiting for local acquisition.
    #[strum(serialize = "pending")]
    Pending,
    /// Streaming.
    #[strum(serialize = "active")]
    Active,
    /// Broadcast streaming.
    #[strum(serialize = "broadcasting")]
    Broadcasting,
}

/// A2DP-specific transport data.
#[derive(Debug)]
pub struct A2dpData {
    /// BlueZ endpoint object path on our side of the negotiation.
    endpoint: String,
    codec_info: &'static A2dpCodecInfo,
    /// Negotiated codec capabilities blob.
    configuration: Vec<u8>,
    state: Mutex<A2dpState>,
    state_cond: Condvar,
    /// Delay reported by the daemon, tenths of a millisecond.
    delay_reported: AtomicU16,
    /// Bytes queued in the socket output buffer right after acquisition;
    /// later queue samples are meaningful only as deltas against this.
    bt_queued_init: AtomicI32,
}

impl A2dpData {
    /// Create the A2DP data for a freshly announced transport.
    pub fn new(
        endpoint: String, codec_info: &'static A2dpCodecInfo, configuration: Vec<u8>, state: A2dpState,
    ) -> Self {
        Self {
            endpoint,
            codec_info,
            configuration,
            state: Mutex::new(state),
            state_cond: Condvar::new(),
            delay_reported: AtomicU16::new(0),
            bt_queued_init: AtomicI32::new(0),
        }
    }

    /// BlueZ endpoint object path.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Negotiated codec descriptor.
    pub fn codec_info(&self) -> &'static A2dpCodecInfo {
        self.codec_info
    }

    /// Negotiated codec capabilities blob.
    pub fn configuration(&self) -> &[u8] {
        &self.configuration
    }

    /// Delay reported by the daemon, tenths of a millisecond.
    pub fn delay_reported(&self) -> u16 {
        self.delay_reported.load(Ordering::Relaxed)
    }

    pub(crate) fn set_delay_reported(&self, dsec: u16) {
        self.delay_reported.store(dsec, Ordering::Relaxed);
    }

    /// Initial output queue sample taken at acquisition.
    pub fn bt_queued_init(&self) -> i32 {
        self.bt_queued_init.load(Ordering::Relaxed)
    }

    /// Post-acquisition socket tuning: shrink the output buffer so that at
    /// most three packets can queue up, and take the initial queue sample.
    pub(crate) fn post_acquire(&self, acquired: &BtAcquired) {
        let sndbuf = 3 * acquired.mtu_write as i32;
        if let Err(err) =
            crate::sock::setsockopt(&acquired.fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &sndbuf)
        {
            log::warn!("shrinking bt socket output buffer: {err}");
        }
        let queued: i32 = crate::sock::ioctl_read(&acquired.fd, libc::TIOCOUTQ as _).unwrap_or(0);
        self.bt_queued_init.store(queued, Ordering::Relaxed);
    }
}

impl Transport {
    fn a2dp(&self) -> &A2dpData {
        match &self.data {
            TransportData::A2dp(a2dp) => a2dp,
            _ => unreachable!("not an A2DP transport"),
        }
    }

    /// Daemon-reported transport state.
    pub fn a2dp_state(&self) -> A2dpState {
        *self.a2dp().state.lock().unwrap()
    }

    /// Apply a state change notification from the daemon.
    pub fn a2dp_state_update(&self, new: A2dpState) {
        let a2dp = self.a2dp();
        let mut state = a2dp.state.lock().unwrap();
        if *state == new {
            return;
        }
        log::debug!("{}: daemon state {} -> {}", self.path(), state, new);
        *state = new;
        drop(state);
        a2dp.state_cond.notify_all();
    }

    /// Wait for the daemon to report the transport as idle.
    ///
    /// A lost notification must not wedge the acquisition path, so the wait
    /// is bounded; on expiry the state is forced to idle locally and the
    /// next acquire proceeds from local bookkeeping.
    fn a2dp_wait_idle(&self, timeout: Duration) {
        let a2dp = self.a2dp();
        let deadline = Instant::now() + timeout;
        let mut state = a2dp.state.lock().unwrap();
        while *state != A2dpState::Idle {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("{}: no idle notification after release, forcing idle", self.path());
                *state = A2dpState::Idle;
                break;
            }
            let (guard, _res) = a2dp.state_cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Release an A2DP transport.
    ///
    /// The daemon call is skipped when the daemon already tore the
    /// transport down (state idle) or the owner is gone; either would make
    /// the call fail pointlessly. A daemon that vanished mid-release is
    /// treated as a successful release.
    pub(crate) fn release_a2dp(&self) -> Result<()> {
        let fd = {
            let mut bt = self.bt.lock().unwrap();
            bt.fd.take()
        };
        if fd.is_none() {
            return Ok(());
        }
        log::debug!("{}: releasing bt socket {}", self.path(), fd.as_ref().unwrap().as_raw_fd());
        drop(fd);

        if self.a2dp_state() == A2dpState::Idle || self.owner().is_empty() {
            return Ok(());
        }
        match (self.release_fn)() {
            Ok(()) => (),
            Err(err) if release_error_absorbed(&err) => {
                log::debug!("{}: release absorbed: {}", self.path(), err);
                self.a2dp_state_update(A2dpState::Idle);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        // A subsequent acquire may race with the daemon still tearing the
        // transport down; wait for the idle notification first.
        self.a2dp_wait_idle(self.config.a2dp_release_timeout);
        Ok(())
    }
}

/// Daemon errors during release that mean "the peer is already gone".
fn release_error_absorbed(err: &Error) -> bool {
    match &err.kind {
        ErrorKind::NotFound => true,
        ErrorKind::Internal(InternalErrorKind::DBus(name)) => {
            name.ends_with(".NoReply") || name.ends_with(".ServiceUnknown") || name.ends_with(".UnknownObject")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test::a2dp_sink_transport;
    use crate::config::Config;

    #[test]
    fn state_parsing() {
        assert_eq!("pending".parse::<A2dpState>().unwrap(), A2dpState::Pending);
        assert_eq!(A2dpState::Broadcasting.to_string(), "broadcasting");
    }

    #[test]
    fn release_of_idle_transport_skips_daemon_call() {
        let t = a2dp_sink_transport(Config::default());
        t.acquire().unwrap();
        // Daemon already reports idle: release must not call the daemon,
        // and the socket must be closed.
        t.a2dp_state_update(A2dpState::Idle);
        t.release().unwrap();
        assert_eq!(t.bt_fd(), -1);
        t.destroy();
    }

    #[test]
    fn release_wait_is_bounded() {
        let mut config = Config::default();
        config.a2dp_release_timeout = Duration::from_millis(50);
        let t = a2dp_sink_transport(config);
        t.acquire().unwrap();
        t.a2dp_state_update(A2dpState::Active);
        let begin = Instant::now();
        t.release().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(2));
        // The timed-out wait forced the local state to idle.
        assert_eq!(t.a2dp_state(), A2dpState::Idle);
        t.destroy();
    }

    #[test]
    fn absorbed_release_errors() {
        let gone = Error::new(ErrorKind::Internal(InternalErrorKind::DBus(
            "org.freedesktop.DBus.Error.ServiceUnknown".into(),
        )));
        assert!(release_error_absorbed(&gone));
        assert!(release_error_absorbed(&Error::new(ErrorKind::NotFound)));
        assert!(!release_error_absorbed(&Error::new(ErrorKind::Failed)));
    }
}
