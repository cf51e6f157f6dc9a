//! Transport PCM endpoints.
//!
//! A transport PCM is one direction of audio on a transport: the negotiated
//! stream parameters, the client FIFO, the volume state and the client
//! controller. The audio itself travels through a unidirectional pipe; an
//! out-of-band `SOCK_SEQPACKET` socket carries one-line control commands.

use std::{
    collections::HashMap,
    fmt,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicU16, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};
use strum::{Display, EnumString};

use crate::{
    multi::PcmMulti,
    sock::{self, OwnedFd},
    thread::{IoThread, Signal},
    transport::{CodecId, Transport},
    volume::ChannelVolume,
    BaEvent, Error, ErrorKind, EventSender, PcmProperty, Result,
};

/// Packed stream format identifier.
///
/// Bit 15 carries the signedness, bit 14 the byte order (set for big
/// endian), bits 13..8 the bytes per sample and bits 7..0 the bit width.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct StreamFormat(pub u16);

impl StreamFormat {
    /// Unsigned 8 bit.
    pub const U8: StreamFormat = StreamFormat(1 << 8 | 8);
    /// Signed 16 bit little endian in two bytes.
    pub const S16_2LE: StreamFormat = StreamFormat(0x8000 | 2 << 8 | 16);
    /// Signed 24 bit little endian in three bytes.
    pub const S24_3LE: StreamFormat = StreamFormat(0x8000 | 3 << 8 | 24);
    /// Signed 24 bit little endian in four bytes.
    pub const S24_4LE: StreamFormat = StreamFormat(0x8000 | 4 << 8 | 24);
    /// Signed 32 bit little endian in four bytes.
    pub const S32_4LE: StreamFormat = StreamFormat(0x8000 | 4 << 8 | 32);

    /// Whether samples are signed.
    pub fn is_signed(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// Whether samples are big endian.
    pub fn is_big_endian(self) -> bool {
        self.0 & 0x4000 != 0
    }

    /// Physical bytes per sample.
    pub fn bytes(self) -> usize {
        ((self.0 >> 8) & 0x3f) as usize
    }

    /// Significant bits per sample.
    pub fn width(self) -> usize {
        (self.0 & 0xff) as usize
    }

    /// Highest representable sample value.
    pub fn amplitude_max(self) -> i64 {
        if self.is_signed() {
            (1i64 << (self.width() - 1)) - 1
        } else {
            (1i64 << self.width()) - 1
        }
    }

    /// Lowest representable sample value.
    pub fn amplitude_min(self) -> i64 {
        if self.is_signed() {
            -(1i64 << (self.width() - 1))
        } else {
            0
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Self::U8 {
            return write!(f, "U8");
        }
        write!(
            f,
            "{}{}_{}{}",
            if self.is_signed() { 'S' } else { 'U' },
            self.width(),
            self.bytes(),
            if self.is_big_endian() { "BE" } else { "LE" },
        )
    }
}

impl fmt::Debug for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Direction of a transport PCM, from the point of view of the client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString)]
pub enum PcmMode {
    /// The PCM produces audio for the client (capture).
    #[strum(serialize = "source")]
    Source,
    /// The client plays audio into the PCM (playback).
    #[strum(serialize = "sink")]
    Sink,
}

/// Control commands accepted on the PCM controller socket.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, EnumString)]
pub enum ControlCommand {
    /// Block until buffered audio has been played out.
    #[strum(serialize = "DRAIN")]
    Drain,
    /// Discard buffered PCM samples.
    #[strum(serialize = "DROP")]
    Drop,
    /// Suspend audio processing.
    #[strum(serialize = "PAUSE")]
    Pause,
    /// Resume audio processing.
    #[strum(serialize = "RESUME")]
    Resume,
    /// Client announces that it attached.
    #[strum(serialize = "OPEN")]
    Open,
    /// Client announces that it is going away.
    #[strum(serialize = "CLOSE")]
    Close,
}

/// Negotiated stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    /// Stream format.
    pub format: StreamFormat,
    /// Channel count.
    pub channels: u8,
    /// Sampling rate in Hz.
    pub rate: u32,
}

impl Default for PcmParams {
    fn default() -> Self {
        Self { format: StreamFormat::S16_2LE, channels: 2, rate: 44100 }
    }
}

/// Per-direction audio endpoint on a transport.
pub struct TransportPcm {
    transport: OnceLock<Weak<Transport>>,
    thread: OnceLock<Weak<IoThread>>,
    mode: PcmMode,
    path: String,
    /// Client FIFO descriptor, `-1` when no client is attached. Workers use
    /// a snapshot of this value around `poll`; the descriptor is only closed
    /// under the client mutex.
    fd: AtomicI32,
    active: AtomicBool,
    params: Mutex<PcmParams>,
    delay: AtomicU16,
    client_delay: AtomicI16,
    /// Per-codec delay adjustment, tenths of a millisecond.
    delay_adjustments: Mutex<HashMap<CodecId, i16>>,
    soft_volume: AtomicBool,
    volume: Mutex<[ChannelVolume; 2]>,
    /// Serializes client attach and detach.
    client_mtx: Mutex<()>,
    multi: Mutex<Option<Arc<PcmMulti>>>,
    events: EventSender,
}

impl fmt::Debug for TransportPcm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransportPcm")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("fd", &self.fd.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransportPcm {
    pub(crate) fn new(mode: PcmMode, path: String, soft_volume: bool, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            transport: OnceLock::new(),
            thread: OnceLock::new(),
            mode,
            path,
            fd: AtomicI32::new(-1),
            active: AtomicBool::new(false),
            params: Mutex::new(PcmParams::default()),
            delay: AtomicU16::new(0),
            client_delay: AtomicI16::new(0),
            delay_adjustments: Mutex::new(HashMap::new()),
            soft_volume: AtomicBool::new(soft_volume),
            volume: Mutex::new([ChannelVolume::default(); 2]),
            client_mtx: Mutex::new(()),
            multi: Mutex::new(None),
            events,
        })
    }

    pub(crate) fn bind(&self, transport: Weak<Transport>, thread: Weak<IoThread>) {
        let _ = self.transport.set(transport);
        let _ = self.thread.set(thread);
    }

    /// Owning transport, if still alive.
    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.get().and_then(|t| t.upgrade())
    }

    /// Bound IO worker.
    pub fn thread(&self) -> Option<Arc<IoThread>> {
        self.thread.get().and_then(|t| t.upgrade())
    }

    /// Direction of this PCM.
    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    /// Presentation path of this PCM.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Client FIFO descriptor snapshot, `-1` when no client is attached.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Whether a client is attached.
    ///
    /// With the mixer spliced in, the FIFO descriptor belongs to the mix
    /// worker; only the mixer's client set counts.
    pub fn has_client(&self) -> bool {
        match self.multi.lock().unwrap().as_ref() {
            Some(multi) => multi.client_count() > 0,
            None => self.fd() >= 0,
        }
    }

    /// Whether audio processing is active (not paused).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Negotiated stream parameters.
    pub fn params(&self) -> PcmParams {
        *self.params.lock().unwrap()
    }

    /// Update the negotiated stream parameters, notifying the front end
    /// about every changed property.
    pub fn set_params(&self, new: PcmParams) {
        let mut params = self.params.lock().unwrap();
        let old = *params;
        *params = new;
        drop(params);
        if old.format != new.format {
            self.emit(PcmProperty::Format(new.format.0));
        }
        if old.channels != new.channels {
            self.emit(PcmProperty::Channels(new.channels));
        }
        if old.rate != new.rate {
            self.emit(PcmProperty::Rate(new.rate));
        }
    }

    /// Audio delay introduced by the transport, tenths of a millisecond,
    /// including the per-codec adjustment.
    pub fn delay(&self) -> i32 {
        let codec = self.transport().map(|t| t.codec()).unwrap_or(CodecId::Undefined);
        let adj = self.delay_adjustments.lock().unwrap().get(&codec).copied().unwrap_or(0);
        self.delay.load(Ordering::Relaxed) as i32 + adj as i32
    }

    pub(crate) fn set_delay(&self, dsec: u16) {
        if self.delay.swap(dsec, Ordering::Relaxed) != dsec {
            self.emit(PcmProperty::Delay(dsec));
        }
    }

    /// Client reported delay adjustment, tenths of a millisecond.
    pub fn client_delay(&self) -> i16 {
        self.client_delay.load(Ordering::Relaxed)
    }

    pub(crate) fn set_client_delay(&self, dsec: i16) {
        if self.client_delay.swap(dsec, Ordering::Relaxed) != dsec {
            self.emit(PcmProperty::ClientDelay(dsec));
        }
    }

    pub(crate) fn delay_adjustments(&self) -> HashMap<CodecId, i16> {
        self.delay_adjustments.lock().unwrap().clone()
    }

    pub(crate) fn set_delay_adjustment(&self, codec: CodecId, dsec: i16) {
        self.delay_adjustments.lock().unwrap().insert(codec, dsec);
    }

    /// Whether volume is scaled in software.
    pub fn soft_volume(&self) -> bool {
        self.soft_volume.load(Ordering::Acquire)
    }

    /// Enable or disable software volume scaling.
    pub fn set_soft_volume(&self, soft: bool) {
        if self.soft_volume.swap(soft, Ordering::AcqRel) != soft {
            self.emit(PcmProperty::SoftVolume(soft));
        }
    }

    /// Current per-channel volume.
    pub fn volume(&self) -> [ChannelVolume; 2] {
        *self.volume.lock().unwrap()
    }

    /// Update the volume state.
    ///
    /// The change is propagated to the front end and, depending on the
    /// profile, to the remote device. With soft-volume enabled the remote
    /// is left alone so that the scaling is not applied twice.
    pub fn volume_update(&self, volume: [ChannelVolume; 2]) {
        self.volume_update_local(volume);
        if let Some(t) = self.transport() {
            t.remote_volume_update(self);
        }
    }

    /// Update the volume state without delegating to the remote device.
    /// Used when the change originated at the remote in the first place.
    pub(crate) fn volume_update_local(&self, volume: [ChannelVolume; 2]) {
        *self.volume.lock().unwrap() = volume;
        let max = self.wire_volume_max();
        let channels = self.params().channels.min(2) as usize;
        let wire: Vec<u8> = volume.iter().take(channels).map(|v| v.to_wire(max)).collect();
        self.emit(PcmProperty::Volume(wire));
    }

    pub(crate) fn wire_volume_max(&self) -> i32 {
        match self.transport() {
            Some(t) if t.profile().is_sco() => crate::volume::RANGE_MAX_SCO,
            _ => crate::volume::RANGE_MAX_A2DP,
        }
    }

    fn emit(&self, property: PcmProperty) {
        let _ = self.events.send(BaEvent::PcmPropertyChanged { path: self.path.clone(), property });
    }

    /// Attach a client: create the FIFO pipe and the controller socket.
    ///
    /// Returns the client half of each. The retained ends are non-blocking.
    /// With multi-client mixing enabled additional clients join the mix;
    /// otherwise a second open fails with [ErrorKind::Busy].
    pub fn open(self: &Arc<Self>) -> Result<(OwnedFd, OwnedFd)> {
        let _client = self.client_mtx.lock().unwrap();

        if let Some(multi) = self.multi.lock().unwrap().as_ref() {
            return multi.add_client();
        }

        if self.fd() >= 0 {
            return Err(Error::new(ErrorKind::Busy));
        }

        let (pipe_rd, pipe_wr) = sock::pipe()?;
        let (ctrl_ours, ctrl_client) = sock::seqpacket_pair()?;

        let (ours, client) = match self.mode {
            // Playback: the client writes, we read.
            PcmMode::Sink => (pipe_rd, pipe_wr),
            // Capture: we write, the client reads.
            PcmMode::Source => (pipe_wr, pipe_rd),
        };
        sock::set_nonblocking(ours.as_raw_fd(), true)?;
        sock::set_nonblocking(ctrl_ours.as_raw_fd(), true)?;

        self.fd.store(ours.into_raw_fd(), Ordering::Release);
        self.set_active(true);

        let pcm = self.clone();
        std::thread::Builder::new()
            .name("ba-pcm-ctrl".into())
            .spawn(move || controller_loop(pcm, ctrl_ours))
            .map_err(Error::from)?;

        if let Some(thread) = self.thread() {
            // The worker may not be up yet; that is fine.
            let _ = thread.signal_send(Signal::PcmOpen);
        }
        log::debug!("{}: client attached", self.path);
        Ok((client, ctrl_client))
    }

    /// Detach the client: close the FIFO and let the keep-alive machinery
    /// decide about transport teardown.
    pub fn release(&self) {
        let _client = self.client_mtx.lock().unwrap();
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return;
        }
        unsafe { libc::close(fd) };
        self.set_active(false);
        log::debug!("{}: client detached", self.path);
        if let Some(thread) = self.thread() {
            let _ = thread.signal_send(Signal::PcmClose);
        }
        if let Some(t) = self.transport() {
            t.stop_if_no_clients();
        }
    }

    /// Worker-side non-blocking read from the client FIFO.
    ///
    /// `Ok(0)` reports client EOF. With multi-client mixing enabled the
    /// descriptor is the internal pipe fed by the mix worker, so nothing
    /// changes from the worker's point of view.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let fd = self.fd();
        if fd < 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        }
        sock::read(fd, buf)
    }

    /// Worker-side non-blocking write of captured audio to the client.
    pub fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let fd = self.fd();
        if fd < 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        }
        sock::write(fd, buf)
    }

    /// Install a descriptor into the FIFO slot, closing any previous one.
    /// Used by the mix worker to splice its internal pipe in.
    pub(crate) fn install_fd(&self, fd: OwnedFd) {
        let old = self.fd.swap(fd.into_raw_fd(), Ordering::AcqRel);
        if old >= 0 {
            unsafe { libc::close(old) };
        }
    }

    pub(crate) fn client_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.client_mtx.lock().unwrap()
    }

    pub(crate) fn has_multi(&self) -> bool {
        self.multi.lock().unwrap().is_some()
    }

    /// Enable multi-client mixing on this PCM.
    pub(crate) fn set_multi(&self, multi: Arc<PcmMulti>) {
        *self.multi.lock().unwrap() = Some(multi);
    }

    pub(crate) fn shutdown_multi(&self) {
        if let Some(multi) = self.multi.lock().unwrap().take() {
            multi.shutdown();
        }
    }
}

/// Serve the client controller socket until the client goes away.
fn controller_loop(pcm: Arc<TransportPcm>, ctrl: OwnedFd) {
    let mut buf = [0u8; 32];
    loop {
        let mut fds = [sock::poll_in(ctrl.as_raw_fd())];
        match sock::poll(&mut fds, None) {
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("{}: controller poll: {}", pcm.path(), err);
                break;
            }
        }
        let len = match sock::read(ctrl.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("{}: controller read: {}", pcm.path(), err);
                break;
            }
        };
        let reply: &[u8] = match std::str::from_utf8(&buf[..len])
            .ok()
            .and_then(|s| ControlCommand::from_str(s.trim_end()).ok())
        {
            Some(cmd) => {
                log::trace!("{}: control command {}", pcm.path(), cmd);
                match execute_command(&pcm, cmd) {
                    Ok(()) => b"OK",
                    Err(err) => {
                        log::warn!("{}: control command {} failed: {}", pcm.path(), cmd, err);
                        b"Invalid"
                    }
                }
            }
            None => b"Invalid",
        };
        let _ = sock::write(ctrl.as_raw_fd(), reply);
    }
    // Client EOF on the controller releases the PCM; the worker threads
    // drive transport teardown through the keep-alive reaper.
    pcm.release();
}

fn execute_command(pcm: &Arc<TransportPcm>, cmd: ControlCommand) -> Result<()> {
    match cmd {
        ControlCommand::Drain => {
            if pcm.mode() == PcmMode::Sink {
                if let Some(thread) = pcm.thread() {
                    thread.drain_wait()?;
                }
            }
            Ok(())
        }
        ControlCommand::Drop => {
            if let Some(thread) = pcm.thread() {
                match thread.signal_send(Signal::PcmDrop) {
                    Ok(()) | Err(Error { kind: ErrorKind::NoSuchThread, .. }) => (),
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        }
        ControlCommand::Pause => {
            pcm.set_active(false);
            if let Some(thread) = pcm.thread() {
                let _ = thread.signal_send(Signal::PcmPause);
            }
            Ok(())
        }
        ControlCommand::Resume => {
            pcm.set_active(true);
            if let Some(thread) = pcm.thread() {
                let _ = thread.signal_send(Signal::PcmResume);
            }
            Ok(())
        }
        ControlCommand::Open | ControlCommand::Close => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_packing() {
        assert_eq!(StreamFormat::S16_2LE.to_string(), "S16_2LE");
        assert_eq!(StreamFormat::U8.to_string(), "U8");
        assert_eq!(StreamFormat::S24_3LE.to_string(), "S24_3LE");
        assert_eq!(StreamFormat::S16_2LE.bytes(), 2);
        assert_eq!(StreamFormat::S16_2LE.width(), 16);
        assert!(StreamFormat::S16_2LE.is_signed());
        assert!(!StreamFormat::S16_2LE.is_big_endian());
        assert_eq!(StreamFormat::S16_2LE.amplitude_max(), i16::MAX as i64);
        assert_eq!(StreamFormat::S16_2LE.amplitude_min(), i16::MIN as i64);
        assert_eq!(StreamFormat::U8.amplitude_max(), 255);
        assert_eq!(StreamFormat::U8.amplitude_min(), 0);
    }

    #[test]
    fn control_commands_parse() {
        assert_eq!(ControlCommand::from_str("DRAIN").unwrap(), ControlCommand::Drain);
        assert_eq!(ControlCommand::from_str("RESUME").unwrap(), ControlCommand::Resume);
        assert!(ControlCommand::from_str("drain").is_err());
        assert!(ControlCommand::from_str("FLUSH").is_err());
    }
}
