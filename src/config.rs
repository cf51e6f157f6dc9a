//! Runtime configuration.

use std::{
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

/// Immutable process configuration.
///
/// A [Config] is handed to the session at creation and shared read-only by
/// every adapter, transport and worker thread. Values that may change at
/// runtime live in [RuntimeState] instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Grace period during which a transport stays acquired after the last
    /// PCM client has closed its FIFO.
    pub keep_alive: Duration,
    /// Upper bound on waiting for the daemon to report a released A2DP
    /// transport as idle. On expiry the transport is treated as idle.
    pub a2dp_release_timeout: Duration,
    /// Upper bound on the HFP codec-selection handshake.
    pub codec_select_timeout: Duration,
    /// Minimum pause between closing a SCO socket and the next connect.
    pub sco_close_connect_grace: Duration,
    /// Timeout of the SCO decoder's very first read, after which the
    /// worker switches to host-driven read sizing.
    pub sco_first_read_timeout: Duration,
    /// Scale volume in software instead of delegating to the remote device.
    pub soft_volume: bool,
    /// Let several clients share one playback PCM through the mixer.
    pub multi_client: bool,
    /// Directory for persistent per-device PCM settings; `None` disables
    /// the storage hooks.
    pub storage_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive: Duration::ZERO,
            a2dp_release_timeout: Duration::from_secs(5),
            codec_select_timeout: Duration::from_secs(2),
            sco_close_connect_grace: Duration::from_millis(300),
            sco_first_read_timeout: Duration::from_millis(100),
            soft_volume: false,
            multi_client: false,
            storage_dir: None,
        }
    }
}

/// Hot-pluggable runtime state shared by all adapters.
#[derive(Debug, Default)]
pub struct RuntimeState {
    inner: Mutex<RuntimeStateInner>,
}

#[derive(Debug, Clone)]
struct RuntimeStateInner {
    hfp_msbc: bool,
    hfp_lc3_swb: bool,
    battery: Option<u8>,
}

impl Default for RuntimeStateInner {
    fn default() -> Self {
        Self { hfp_msbc: true, hfp_lc3_swb: true, battery: None }
    }
}

impl RuntimeState {
    /// Whether mSBC codec selection is currently enabled for HFP.
    pub fn hfp_msbc(&self) -> bool {
        self.inner.lock().unwrap().hfp_msbc
    }

    /// Whether LC3-SWB codec selection is currently enabled for HFP.
    pub fn hfp_lc3_swb(&self) -> bool {
        self.inner.lock().unwrap().hfp_lc3_swb
    }

    /// Enable or disable HFP wide-band codecs at runtime.
    pub fn set_hfp_codecs(&self, msbc: bool, lc3_swb: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.hfp_msbc = msbc;
        inner.hfp_lc3_swb = lc3_swb;
    }

    /// Host battery level reported to remote devices, percent.
    pub fn battery(&self) -> Option<u8> {
        self.inner.lock().unwrap().battery
    }

    /// Update the host battery level reported to remote devices.
    pub fn set_battery(&self, level: Option<u8>) {
        self.inner.lock().unwrap().battery = level.map(|v| v.min(100));
    }
}
