//! Bluetooth transports.
//!
//! A transport aggregates one Bluetooth socket, the negotiated codec, a pair
//! of [PCM endpoints](crate::pcm::TransportPcm), a pair of
//! [IO workers](crate::thread::IoThread) and a
//! [supervisor](crate::manager::ThreadManager). The daemon-facing
//! acquire/release callbacks are installed at creation, so the core never
//! needs to know whether the socket comes from a BlueZ media transport, from
//! an outgoing SCO connect, or from a test stub.

use custom_debug::Debug as CustomDebug;
use std::{
    os::unix::io::{AsRawFd, RawFd},
    sync::{Arc, Condvar, Mutex, OnceLock, Weak},
    time::Instant,
};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    codec,
    config::Config,
    device::Device,
    manager::{Command, ThreadManager},
    pcm::{PcmMode, TransportPcm},
    sock::OwnedFd,
    thread::{IoThread, IoWorker, ThreadState},
    BaEvent, Error, ErrorKind, EventSender, PcmProperty, Result,
};

mod a2dp;
mod midi;
mod sco;

pub use a2dp::{A2dpData, A2dpState};
pub use midi::MidiData;
pub use sco::{RfcommLink, RfcommSignal, ScoData};

/// Bluetooth profile of a transport.
///
/// The string form is the token used in D-Bus object paths.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum Profile {
    /// A2DP source: local audio is streamed to the remote device.
    #[strum(serialize = "a2dpsrc")]
    A2dpSource,
    /// A2DP sink: the remote device streams audio to us.
    #[strum(serialize = "a2dpsnk")]
    A2dpSink,
    /// HFP hands-free unit role.
    #[strum(serialize = "hfphf")]
    HfpHf,
    /// HFP audio gateway role.
    #[strum(serialize = "hfpag")]
    HfpAg,
    /// HSP headset role.
    #[strum(serialize = "hsphs")]
    HspHs,
    /// HSP audio gateway role.
    #[strum(serialize = "hspag")]
    HspAg,
    /// BLE MIDI peripheral.
    #[strum(serialize = "midi")]
    Midi,
}

const fn uuid16(id: u32) -> Uuid {
    Uuid::from_u128(((id as u128) << 96) | 0x00000000_0000_1000_8000_00805f9b34fb)
}

impl Profile {
    /// Whether this is an A2DP profile.
    pub fn is_a2dp(self) -> bool {
        matches!(self, Profile::A2dpSource | Profile::A2dpSink)
    }

    /// Whether this profile transports voice over SCO.
    pub fn is_sco(self) -> bool {
        matches!(self, Profile::HfpHf | Profile::HfpAg | Profile::HspHs | Profile::HspAg)
    }

    /// Whether this is an audio gateway role.
    pub fn is_ag(self) -> bool {
        matches!(self, Profile::HfpAg | Profile::HspAg)
    }

    /// Service class UUID of the profile.
    pub fn uuid(self) -> Uuid {
        match self {
            Profile::A2dpSource => uuid16(0x110a),
            Profile::A2dpSink => uuid16(0x110b),
            Profile::HfpHf => uuid16(0x111e),
            Profile::HfpAg => uuid16(0x111f),
            Profile::HspHs => uuid16(0x1108),
            Profile::HspAg => uuid16(0x1112),
            Profile::Midi => Uuid::from_u128(0x03b80e5a_ede8_4b33_a751_6ce34ec4c700),
        }
    }
}

/// Codec identifier.
///
/// The string form matches the names exposed over D-Bus.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum CodecId {
    /// Codec not yet negotiated (HFP before codec selection).
    #[strum(serialize = "undefined")]
    Undefined,
    /// SBC (A2DP mandatory codec).
    #[strum(serialize = "SBC")]
    Sbc,
    /// MPEG-1/2 audio (MP3).
    #[strum(serialize = "MPEG")]
    Mpeg,
    /// MPEG-2/4 AAC.
    #[strum(serialize = "AAC")]
    Aac,
    /// Qualcomm aptX.
    #[strum(serialize = "aptX")]
    AptX,
    /// Qualcomm aptX HD.
    #[strum(serialize = "aptX-HD")]
    AptXHd,
    /// CSR FastStream (bidirectional SBC variant).
    #[strum(serialize = "FastStream")]
    FastStream,
    /// Sony LDAC.
    #[strum(serialize = "LDAC")]
    Ldac,
    /// CVSD (SCO narrow-band).
    #[strum(serialize = "CVSD")]
    Cvsd,
    /// mSBC (eSCO wide-band).
    #[strum(serialize = "mSBC")]
    Msbc,
    /// LC3-SWB (eSCO super-wide-band).
    #[strum(serialize = "LC3-SWB")]
    Lc3Swb,
}

/// An acquired Bluetooth socket with its transfer units.
#[derive(Debug)]
pub struct BtAcquired {
    /// The transport socket.
    pub fd: OwnedFd,
    /// Maximum bytes per read.
    pub mtu_read: usize,
    /// Maximum bytes per write.
    pub mtu_write: usize,
}

/// How the transport socket is requested from the daemon.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AcquireKind {
    /// Regular acquisition.
    Normal,
    /// Non-initiating acquisition, used while the daemon reports the
    /// transport as pending.
    Try,
}

/// Callback acquiring the transport socket.
pub type AcquireFn = Box<dyn Fn(AcquireKind) -> Result<BtAcquired> + Send + Sync>;
/// Callback releasing the transport socket on the daemon side.
pub type ReleaseFn = Box<dyn Fn() -> Result<()> + Send + Sync>;
/// Callback pushing the local volume to the remote device.
pub type RemoteVolumeFn = Box<dyn Fn(&TransportPcm) -> Result<()> + Send + Sync>;

/// Profile-specific transport data.
#[derive(Debug)]
pub enum TransportData {
    /// A2DP media transport.
    A2dp(A2dpData),
    /// HFP/HSP voice link.
    Sco(ScoData),
    /// BLE MIDI link.
    Midi(MidiData),
}

/// Bluetooth socket slot, guarded by the transport socket mutex.
#[derive(Debug, Default)]
pub(crate) struct BtLink {
    pub fd: Option<OwnedFd>,
    pub mtu_read: usize,
    pub mtu_write: usize,
    /// While set, the only legal operation on the socket is release.
    pub stopping: bool,
}

/// One Bluetooth transport.
#[derive(CustomDebug)]
pub struct Transport {
    #[debug(skip)]
    device: Arc<Device>,
    owner: String,
    path: String,
    profile: Profile,
    codec: Mutex<CodecId>,
    #[debug(skip)]
    pub(crate) codec_cond: Condvar,
    #[debug(skip)]
    pub(crate) bt: Mutex<BtLink>,
    #[debug(skip)]
    stopped_cond: Condvar,
    /// Serializes acquisition so that a concurrent `start` never samples a
    /// half-set socket state. Always taken before the socket mutex.
    #[debug(skip)]
    acquisition: Mutex<()>,
    #[debug(skip)]
    pcm: Arc<TransportPcm>,
    #[debug(skip)]
    pcm_bc: Arc<TransportPcm>,
    #[debug(skip)]
    thread_enc: Arc<IoThread>,
    #[debug(skip)]
    thread_dec: Arc<IoThread>,
    #[debug(skip)]
    manager: OnceLock<ThreadManager>,
    /// Profile-specific state.
    pub data: TransportData,
    #[debug(skip)]
    acquire_fn: AcquireFn,
    #[debug(skip)]
    release_fn: ReleaseFn,
    #[debug(skip)]
    remote_volume_fn: Option<RemoteVolumeFn>,
    #[debug(skip)]
    pub(crate) config: Arc<Config>,
    #[debug(skip)]
    events: EventSender,
}

/// Everything needed to create a transport.
pub struct TransportCreate {
    /// Owning device.
    pub device: Arc<Device>,
    /// D-Bus name of the daemon owning the remote end, empty when unknown.
    pub owner: String,
    /// Daemon-assigned object path of the transport.
    pub path: String,
    /// Profile of the transport.
    pub profile: Profile,
    /// Profile-specific data.
    pub data: TransportData,
    /// Socket acquisition callback.
    pub acquire: AcquireFn,
    /// Socket release callback.
    pub release: ReleaseFn,
    /// Remote volume delegation callback, if the profile supports one.
    pub remote_volume: Option<RemoteVolumeFn>,
}

impl Transport {
    /// Create a transport and register it with its device.
    pub fn new(create: TransportCreate) -> Result<Arc<Transport>> {
        let TransportCreate { device, owner, path, profile, data, acquire, release, remote_volume } = create;

        let config = device.adapter().config().clone();
        let events = device.adapter().events();

        let codec = match &data {
            TransportData::A2dp(a2dp) => a2dp.codec_info().id,
            TransportData::Sco(sco) => sco.initial_codec(profile),
            TransportData::Midi(_) => CodecId::Undefined,
        };

        // The main PCM carries the profile's primary direction; its worker
        // is the master and releases the transport on exit.
        let (main_mode, bc_mode) = match profile {
            Profile::A2dpSource => (PcmMode::Sink, PcmMode::Source),
            Profile::A2dpSink => (PcmMode::Source, PcmMode::Sink),
            Profile::HfpAg | Profile::HspAg => (PcmMode::Sink, PcmMode::Source),
            Profile::HfpHf | Profile::HspHs => (PcmMode::Source, PcmMode::Sink),
            Profile::Midi => (PcmMode::Sink, PcmMode::Source),
        };

        let base = format!("{}/{}", device.path(), profile);
        let pcm = TransportPcm::new(main_mode, format!("{base}/{main_mode}"), config.soft_volume, events.clone());
        let pcm_bc = TransportPcm::new(bc_mode, format!("{base}/{bc_mode}"), config.soft_volume, events.clone());

        let thread_enc = Arc::new(IoThread::new(
            "enc",
            if main_mode == PcmMode::Sink { pcm.path().into() } else { pcm_bc.path().into() },
            events.clone(),
        ));
        let thread_dec = Arc::new(IoThread::new(
            "dec",
            if main_mode == PcmMode::Source { pcm.path().into() } else { pcm_bc.path().into() },
            events.clone(),
        ));

        let transport = Arc::new_cyclic(|weak: &Weak<Transport>| {
            pcm.bind(
                weak.clone(),
                Arc::downgrade(if main_mode == PcmMode::Sink { &thread_enc } else { &thread_dec }),
            );
            pcm_bc.bind(
                weak.clone(),
                Arc::downgrade(if bc_mode == PcmMode::Sink { &thread_enc } else { &thread_dec }),
            );
            Transport {
                device: device.clone(),
                owner,
                path,
                profile,
                codec: Mutex::new(codec),
                codec_cond: Condvar::new(),
                bt: Mutex::new(BtLink::default()),
                stopped_cond: Condvar::new(),
                acquisition: Mutex::new(()),
                pcm,
                pcm_bc,
                thread_enc,
                thread_dec,
                manager: OnceLock::new(),
                data,
                acquire_fn: acquire,
                release_fn: release,
                remote_volume_fn: remote_volume,
                config,
                events,
            }
        });

        let manager = ThreadManager::start(Arc::downgrade(&transport), transport.config.keep_alive)?;
        let _ = transport.manager.set(manager);

        codec::transport_init(&transport)?;
        transport.storage_load();
        device.register_transport(&transport)?;
        log::debug!("created {} transport {}", profile, transport.path);
        Ok(transport)
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Daemon bus name owning the remote object, empty when unknown.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Daemon-assigned object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Transport profile.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Currently negotiated codec.
    pub fn codec(&self) -> CodecId {
        *self.codec.lock().unwrap()
    }

    /// Main-direction PCM endpoint.
    pub fn pcm(&self) -> &Arc<TransportPcm> {
        &self.pcm
    }

    /// Back-channel PCM endpoint.
    pub fn pcm_bc(&self) -> &Arc<TransportPcm> {
        &self.pcm_bc
    }

    /// Encoder worker.
    pub fn thread_enc(&self) -> &Arc<IoThread> {
        &self.thread_enc
    }

    /// Decoder worker.
    pub fn thread_dec(&self) -> &Arc<IoThread> {
        &self.thread_dec
    }

    /// Raw Bluetooth socket snapshot, `-1` when not acquired.
    pub fn bt_fd(&self) -> RawFd {
        self.bt.lock().unwrap().fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    /// Read and write MTU of the acquired socket.
    pub fn mtus(&self) -> (usize, usize) {
        let bt = self.bt.lock().unwrap();
        (bt.mtu_read, bt.mtu_write)
    }

    /// Whether an asynchronous stop is in flight.
    pub fn is_stopping(&self) -> bool {
        self.bt.lock().unwrap().stopping
    }

    fn manager(&self) -> Option<&ThreadManager> {
        self.manager.get()
    }

    /// Acquire the transport socket from the daemon.
    ///
    /// Serialized by the acquisition mutex; a second caller finds the
    /// socket installed and returns immediately.
    pub fn acquire(self: &Arc<Self>) -> Result<()> {
        let _acq = self.acquisition.lock().unwrap();
        {
            let bt = self.bt.lock().unwrap();
            if bt.stopping {
                return Err(Error::new(ErrorKind::Stopping));
            }
            if bt.fd.is_some() {
                return Ok(());
            }
        }

        let kind = match &self.data {
            TransportData::A2dp(_) if self.a2dp_state() == A2dpState::Pending => AcquireKind::Try,
            TransportData::Sco(sco) => {
                sco.close_connect_wait(self.config.sco_close_connect_grace);
                AcquireKind::Normal
            }
            _ => AcquireKind::Normal,
        };

        let acquired = (self.acquire_fn)(kind)?;
        if let TransportData::A2dp(a2dp) = &self.data {
            a2dp.post_acquire(&acquired);
        }
        log::debug!(
            "{}: acquired bt socket {} (MTU {}/{})",
            self.path,
            acquired.fd.as_raw_fd(),
            acquired.mtu_read,
            acquired.mtu_write
        );

        let mut bt = self.bt.lock().unwrap();
        if bt.fd.is_some() {
            // An incoming link was installed while we were acquiring; keep
            // it and drop the socket we just obtained.
            return Ok(());
        }
        bt.mtu_read = acquired.mtu_read;
        bt.mtu_write = acquired.mtu_write;
        bt.fd = Some(acquired.fd);
        Ok(())
    }

    /// Install an externally accepted socket, e.g. from the SCO dispatcher.
    pub(crate) fn install_bt(&self, acquired: BtAcquired) -> Result<()> {
        let mut bt = self.bt.lock().unwrap();
        if bt.stopping {
            return Err(Error::new(ErrorKind::Stopping));
        }
        if bt.fd.is_some() {
            return Err(Error::new(ErrorKind::Busy));
        }
        bt.mtu_read = acquired.mtu_read;
        bt.mtu_write = acquired.mtu_write;
        bt.fd = Some(acquired.fd);
        Ok(())
    }

    /// Release the transport socket.
    pub fn release(&self) -> Result<()> {
        match &self.data {
            TransportData::A2dp(_) => self.release_a2dp(),
            TransportData::Sco(sco) => {
                let had_fd = {
                    let mut bt = self.bt.lock().unwrap();
                    bt.fd.take().is_some()
                };
                if had_fd {
                    sco.mark_closed(Instant::now());
                    if let Err(err) = (self.release_fn)() {
                        log::debug!("{}: SCO release: {}", self.path, err);
                    }
                    log::debug!("{}: released bt socket", self.path);
                }
                Ok(())
            }
            TransportData::Midi(_) => {
                self.bt.lock().unwrap().fd.take();
                Ok(())
            }
        }
    }

    /// Start the codec worker threads for the acquired socket.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        codec::transport_start(self)
    }

    /// Spawn one IO worker bound to the given thread slot.
    ///
    /// The worker receives a private duplicate of the Bluetooth socket and a
    /// fresh self-pipe. A scope guard moves the state machine to Terminated
    /// and, for the master worker, releases the whole transport on exit.
    pub(crate) fn start_io_thread(
        self: &Arc<Self>, thread: &Arc<IoThread>, master: bool,
        body: impl FnOnce(IoWorker) + Send + 'static,
    ) -> Result<()> {
        match thread.state() {
            // Already up; starting is idempotent.
            ThreadState::Starting | ThreadState::Running => return Ok(()),
            ThreadState::Stopping | ThreadState::Joining => return Err(Error::new(ErrorKind::Stopping)),
            ThreadState::Terminated | ThreadState::Idle => (),
        }
        let dup = {
            let bt = self.bt.lock().unwrap();
            match &bt.fd {
                Some(fd) => fd.duplicate()?,
                None => return Err(Error::new(ErrorKind::NotAcquired)),
            }
        };
        let (sig_rx, sig_tx) = crate::sock::pipe()?;
        crate::sock::set_nonblocking(sig_rx.as_raw_fd(), true)?;

        thread.clear_stop();
        thread.install_pipe(sig_tx);
        thread.master.store(master, std::sync::atomic::Ordering::Release);
        if thread.state() == ThreadState::Terminated {
            thread.state_set(ThreadState::Idle)?;
        }
        thread.state_set(ThreadState::Starting)?;

        let transport = self.clone();
        let th = thread.clone();
        let join = std::thread::Builder::new()
            .name(format!("ba-io-{}", thread.name()))
            .spawn(move || {
                struct Cleanup {
                    transport: Arc<Transport>,
                    thread: Arc<IoThread>,
                }
                impl Drop for Cleanup {
                    fn drop(&mut self) {
                        let _ = self.thread.state_set(ThreadState::Stopping);
                        self.thread.drain_complete();
                        let _ = self.thread.state_set(ThreadState::Terminated);
                        self.thread.remove_pipe();
                        if self.thread.master.load(std::sync::atomic::Ordering::Acquire) {
                            if let Err(err) = self.transport.release() {
                                log::error!("{}: release on worker exit: {}", self.transport.path(), err);
                            }
                        }
                    }
                }
                let _cleanup = Cleanup { transport, thread: th.clone() };
                body(IoWorker::new(th, dup, sig_rx));
            })
            .map_err(Error::from)?;
        *thread.join.lock().unwrap() = Some(join);
        Ok(())
    }

    /// Synchronously cancel both workers and broadcast the stopped
    /// condition. Runs on the supervisor thread.
    pub(crate) fn cancel_worker_threads(&self) {
        for thread in [&self.thread_enc, &self.thread_dec] {
            if thread.state() > ThreadState::Idle {
                let _ = thread.state_set(ThreadState::Stopping);
            }
            thread.request_stop();
        }
        for thread in [&self.thread_enc, &self.thread_dec] {
            let join = thread.join.lock().unwrap().take();
            if let Some(join) = join {
                let _ = thread.state_set(ThreadState::Joining);
                if let Err(err) = join.join() {
                    log::error!("{}: {} worker panicked: {:?}", self.path, thread.name(), err);
                }
            }
            // A worker that never ran wraps directly to Terminated.
            let _ = thread.state_set(ThreadState::Terminated);
            thread.clear_stop();
        }
        {
            let mut bt = self.bt.lock().unwrap();
            bt.stopping = false;
        }
        self.stopped_cond.notify_all();
    }

    /// Keep-alive expiry: tear the workers down only when every client
    /// FIFO is closed. Runs on the supervisor thread.
    pub(crate) fn reap_if_no_clients(&self) {
        {
            let _main = self.pcm.client_lock();
            let _bc = self.pcm_bc.client_lock();
            let mut bt = self.bt.lock().unwrap();
            if self.pcm.has_client() || self.pcm_bc.has_client() {
                return;
            }
            if bt.fd.is_none()
                && self.thread_enc.state() == ThreadState::Terminated
                && self.thread_dec.state() == ThreadState::Terminated
            {
                return;
            }
            bt.stopping = true;
        }
        log::debug!("{}: no clients left, stopping", self.path);
        for thread in [&self.thread_enc, &self.thread_dec] {
            if thread.state() > ThreadState::Idle {
                let _ = thread.state_set(ThreadState::Stopping);
            }
        }
        self.cancel_worker_threads();
        // The master worker released the socket on its way out; when no
        // worker ever ran the socket is still ours to drop.
        if self.bt_fd() >= 0 {
            let _ = self.release();
        }
    }

    /// Request an asynchronous stop of both workers.
    pub fn stop_async(&self) {
        {
            let mut bt = self.bt.lock().unwrap();
            if bt.stopping {
                return;
            }
            bt.stopping = true;
        }
        for thread in [&self.thread_enc, &self.thread_dec] {
            if thread.state() > ThreadState::Idle {
                let _ = thread.state_set(ThreadState::Stopping);
            }
        }
        if let Some(manager) = self.manager() {
            let _ = manager.send(Command::CancelThreads);
        }
    }

    /// Stop both workers and wait until the transport is fully stopped.
    pub fn stop(&self) {
        if let Some(manager) = self.manager() {
            let _ = manager.send(Command::CancelThreads);
        }
        let mut bt = self.bt.lock().unwrap();
        while bt.stopping
            || self.thread_enc.state() != ThreadState::Terminated
            || self.thread_dec.state() != ThreadState::Terminated
        {
            let (guard, _res) =
                self.stopped_cond.wait_timeout(bt, std::time::Duration::from_millis(100)).unwrap();
            bt = guard;
        }
    }

    /// Schedule a keep-alive check; the supervisor cancels the workers when
    /// the grace period passes with no client attached.
    pub fn stop_if_no_clients(&self) {
        if let Some(manager) = self.manager() {
            let _ = manager.send(Command::CancelIfNoClients);
        }
    }

    /// Select the transport codec.
    ///
    /// Only HFP transports with a codec-selection capable RFCOMM link can
    /// honour this; everything else reports [ErrorKind::NotSupported].
    pub fn select_codec(self: &Arc<Self>, codec: CodecId) -> Result<()> {
        match &self.data {
            TransportData::Sco(sco) => self.select_codec_sco(sco, codec),
            _ => Err(Error::new(ErrorKind::NotSupported)),
        }
    }

    /// The PCM endpoints that are published over D-Bus for this transport.
    ///
    /// The A2DP back channel only exists for codecs that carry one.
    pub fn exported_pcms(self: &Arc<Self>) -> Vec<Arc<TransportPcm>> {
        match &self.data {
            TransportData::A2dp(a2dp) => {
                let mut pcms = vec![self.pcm.clone()];
                if a2dp.codec_info().back_channel {
                    pcms.push(self.pcm_bc.clone());
                }
                pcms
            }
            TransportData::Sco(_) => vec![self.pcm.clone(), self.pcm_bc.clone()],
            TransportData::Midi(_) => Vec::new(),
        }
    }

    /// Codecs this transport can use.
    pub fn codec_list(&self) -> Vec<CodecId> {
        match &self.data {
            TransportData::A2dp(a2dp) => vec![a2dp.codec_info().id],
            TransportData::Sco(sco) => sco.codec_list(self.profile, &self.device.adapter().runtime()),
            TransportData::Midi(_) => Vec::new(),
        }
    }

    /// Install a newly negotiated codec.
    ///
    /// Called by the RFCOMM worker once the remote confirmed the selection;
    /// refreshes the PCM stream parameters and wakes selection waiters.
    pub fn codec_updated(self: &Arc<Self>, codec: CodecId) {
        {
            let mut cur = self.codec.lock().unwrap();
            if *cur == codec {
                return;
            }
            *cur = codec;
        }
        self.codec_cond.notify_all();
        if let Err(err) = codec::transport_init(self) {
            log::error!("{}: codec init: {}", self.path, err);
        }
        for pcm in [&self.pcm, &self.pcm_bc] {
            let _ = self.events.send(BaEvent::PcmPropertyChanged {
                path: pcm.path().to_string(),
                property: PcmProperty::Codec(codec.to_string()),
            });
        }
        log::debug!("{}: codec updated to {}", self.path, codec);
    }

    /// Delegate a volume change to the remote device where the profile
    /// calls for it. Soft-volume transports scale locally only, preventing
    /// the attenuation from being applied twice.
    pub(crate) fn remote_volume_update(&self, pcm: &TransportPcm) {
        if pcm.soft_volume() {
            return;
        }
        match self.profile {
            Profile::A2dpSink => {
                if let Some(f) = &self.remote_volume_fn {
                    if let Err(err) = f(pcm) {
                        log::warn!("{}: remote volume update: {}", self.path, err);
                    }
                }
            }
            Profile::HfpHf | Profile::HspHs => {
                if let TransportData::Sco(sco) = &self.data {
                    sco.signal_rfcomm(RfcommSignal::UpdateVolume);
                }
            }
            _ => (),
        }
    }

    fn storage_load(&self) {
        if let Some(dir) = &self.config.storage_dir {
            crate::storage::pcm_data_sync(dir, self.device.address(), &self.pcm);
            crate::storage::pcm_data_sync(dir, self.device.address(), &self.pcm_bc);
        }
    }

    fn storage_save(&self) {
        if let Some(dir) = &self.config.storage_dir {
            crate::storage::pcm_data_update(dir, self.device.address(), &self.pcm);
            crate::storage::pcm_data_update(dir, self.device.address(), &self.pcm_bc);
        }
    }

    /// Tear the transport down: stop the workers, persist PCM settings and
    /// unregister from the owning device.
    pub fn destroy(self: &Arc<Self>) {
        log::debug!("destroying transport {}", self.path);
        self.stop();
        if self.bt_fd() >= 0 {
            let _ = self.release();
        }
        self.storage_save();
        self.pcm.release();
        self.pcm_bc.release();
        self.pcm.shutdown_multi();
        self.pcm_bc.shutdown_multi();
        if let Some(manager) = self.manager() {
            manager.terminate();
        }
        self.device.unregister_transport(&self.path);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{config::Config, device::Device, Adapter, Address};

    /// Acquire stub handing out one half of a fresh socket pair.
    pub fn stub_acquire() -> AcquireFn {
        Box::new(|_kind| {
            let (ours, _theirs) = crate::sock::seqpacket_pair()?;
            Ok(BtAcquired { fd: ours, mtu_read: 48, mtu_write: 48 })
        })
    }

    pub fn stub_release() -> ReleaseFn {
        Box::new(|| Ok(()))
    }

    pub fn test_device(config: Config) -> Arc<Device> {
        let adapter = Adapter::new(0, Arc::new(config), Default::default(), crate::null_events());
        adapter.device_get_or_create("12:34:56:78:9A:BC".parse::<Address>().unwrap())
    }

    pub fn a2dp_sink_transport(config: Config) -> Arc<Transport> {
        let device = test_device(config);
        Transport::new(TransportCreate {
            device: device.clone(),
            owner: ":1.42".into(),
            path: "/org/bluez/hci0/dev_BC_9A_78_56_34_12/fd0".into(),
            profile: Profile::A2dpSink,
            data: TransportData::A2dp(A2dpData::new(
                "/org/bluez/hci0/dev_BC_9A_78_56_34_12/sep1".into(),
                crate::codec::a2dp_codec_info(CodecId::Sbc).unwrap(),
                // SBC: 44100 Hz, stereo.
                vec![0x21, 0x15, 2, 53],
                A2dpState::Idle,
            )),
            acquire: stub_acquire(),
            release: stub_release(),
            remote_volume: None,
        })
        .unwrap()
    }

    #[test]
    fn transport_paths_and_codec() {
        let t = a2dp_sink_transport(Config::default());
        assert_eq!(t.codec(), CodecId::Sbc);
        assert_eq!(t.pcm().mode(), crate::pcm::PcmMode::Source);
        assert!(t.pcm().path().ends_with("/a2dpsnk/source"));
        assert_eq!(t.bt_fd(), -1);
        let params = t.pcm().params();
        assert_eq!(params.rate, 44100);
        assert_eq!(params.channels, 2);
        assert_eq!(params.format, crate::pcm::StreamFormat::S16_2LE);

        let device = t.device().clone();
        t.destroy();
        // Nothing stays registered after teardown.
        assert!(device.transport(t.path()).is_none());
        assert!(device.is_empty());
    }

    #[test]
    fn acquire_is_idempotent() {
        let t = a2dp_sink_transport(Config::default());
        t.acquire().unwrap();
        let fd = t.bt_fd();
        assert!(fd >= 0);
        t.acquire().unwrap();
        assert_eq!(t.bt_fd(), fd);
        assert_eq!(t.mtus(), (48, 48));
        t.destroy();
        assert_eq!(t.bt_fd(), -1);
    }
}
