//! Multi-client PCM serving.
//!
//! A PCM-multi sits between several local clients and one transport PCM.
//! It splices an internal pipe into the PCM's FIFO slot, so the transport
//! workers keep their single-FIFO view of the world: on playback the mix
//! worker sums all client streams into the [MixBuffer](crate::mix::MixBuffer)
//! and feeds the mixed result into the internal pipe; on capture it reads
//! the internal pipe and fans the audio out to every attached client.

use std::{
    io::ErrorKind as IoErrorKind,
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    mix::MixBuffer,
    pcm::{PcmMode, TransportPcm},
    sock::{self, OwnedFd},
    Error, Result,
};

/// Periods of audio the internal pipe may buffer ahead of the worker.
const CLIENT_PERIOD_DIVISOR: u32 = 100;
const MIX_CAPACITY_PERIODS: usize = 16;

struct MultiClient {
    id: u64,
    /// Our end of the client audio pipe.
    pipe: OwnedFd,
    /// Our end of the client controller socket.
    ctrl: OwnedFd,
    /// Mix cursor of this client (playback).
    offset: u64,
}

/// Multi-client fan-in/fan-out worker of one transport PCM.
pub struct PcmMulti {
    pcm: Weak<TransportPcm>,
    playback: bool,
    clients: Mutex<Vec<MultiClient>>,
    /// Wakes the worker when the client set changes.
    event: OwnedFd,
    /// Our end of the internal pipe towards the transport worker.
    internal: OwnedFd,
    mix: Mutex<MixBuffer>,
    drain: AtomicBool,
    drop_pending: AtomicBool,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PcmMulti {
    /// Create the multi worker and splice it into the PCM.
    pub fn start(pcm: &Arc<TransportPcm>) -> Result<Arc<Self>> {
        let params = pcm.params();
        let playback = pcm.mode() == PcmMode::Sink;
        let period = (params.rate / CLIENT_PERIOD_DIVISOR).max(16) as usize;
        let mix = MixBuffer::new(params.format, params.channels as usize, period, MIX_CAPACITY_PERIODS * period)?;

        let (pipe_rd, pipe_wr) = sock::pipe()?;
        let (worker_end, internal) = if playback { (pipe_rd, pipe_wr) } else { (pipe_wr, pipe_rd) };
        sock::set_nonblocking(worker_end.as_raw_fd(), true)?;
        sock::set_nonblocking(internal.as_raw_fd(), true)?;
        pcm.install_fd(worker_end);
        pcm.set_active(true);

        let multi = Arc::new(Self {
            pcm: Arc::downgrade(pcm),
            playback,
            clients: Mutex::new(Vec::new()),
            event: sock::eventfd()?,
            internal,
            mix: Mutex::new(mix),
            drain: AtomicBool::new(false),
            drop_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(None),
        });
        let worker = multi.clone();
        let join = std::thread::Builder::new()
            .name("ba-pcm-multi".into())
            .spawn(move || worker.run())
            .map_err(Error::from)?;
        *multi.thread.lock().unwrap() = Some(join);
        pcm.set_multi(multi.clone());
        Ok(multi)
    }

    /// Number of currently attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Attach a new client; returns its (audio, control) descriptors.
    pub(crate) fn add_client(&self) -> Result<(OwnedFd, OwnedFd)> {
        let (pipe_rd, pipe_wr) = sock::pipe()?;
        let (ctrl_ours, ctrl_client) = sock::seqpacket_pair()?;
        let (ours, client) = if self.playback { (pipe_rd, pipe_wr) } else { (pipe_wr, pipe_rd) };
        sock::set_nonblocking(ours.as_raw_fd(), true)?;
        sock::set_nonblocking(ctrl_ours.as_raw_fd(), true)?;

        let offset = self.mix.lock().unwrap().readable();
        let mut clients = self.clients.lock().unwrap();
        clients.push(MultiClient {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pipe: ours,
            ctrl: ctrl_ours,
            offset,
        });
        drop(clients);
        self.wake();
        Ok((client, ctrl_client))
    }

    /// Stop the worker and detach every client.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(join) = self.thread.lock().unwrap().take() {
            if join.thread().id() != std::thread::current().id() {
                let _ = join.join();
            }
        }
    }

    fn wake(&self) {
        let _ = sock::write(self.event.as_raw_fd(), &1u64.to_ne_bytes());
    }

    fn scales(&self) -> [f64; 2] {
        match self.pcm.upgrade() {
            Some(pcm) if pcm.soft_volume() => {
                let volume = pcm.volume();
                [volume[0].scale(), volume[1].scale()]
            }
            _ => [1.0, 1.0],
        }
    }

    fn run(self: Arc<Self>) {
        let frame = self.mix.lock().unwrap().frame_bytes();
        let period = self.mix.lock().unwrap().period();
        let mut buf = vec![0u8; period * frame];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let mut fds = vec![sock::poll_in(self.event.as_raw_fd())];
            let client_ids: Vec<u64> = {
                let clients = self.clients.lock().unwrap();
                for client in clients.iter() {
                    if self.playback {
                        fds.push(sock::poll_in(client.pipe.as_raw_fd()));
                    }
                    fds.push(sock::poll_in(client.ctrl.as_raw_fd()));
                }
                clients.iter().map(|c| c.id).collect()
            };
            if !self.playback {
                fds.push(sock::poll_in(self.internal.as_raw_fd()));
            }

            match sock::poll(&mut fds, Some(Duration::from_millis(500))) {
                Ok(_) => (),
                Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("pcm multi poll: {err}");
                    break;
                }
            }

            if fds[0].revents != 0 {
                let mut drained = [0u8; 8];
                let _ = sock::read(self.event.as_raw_fd(), &mut drained);
            }

            let mut gone: Vec<u64> = Vec::new();
            {
                let mut clients = self.clients.lock().unwrap();
                let mut fd_idx = 1;
                for id in &client_ids {
                    let audio_ready = if self.playback {
                        let ready = fds[fd_idx].revents != 0;
                        fd_idx += 1;
                        ready
                    } else {
                        false
                    };
                    let ctrl_ready = fds[fd_idx].revents != 0;
                    fd_idx += 1;
                    let Some(client) = clients.iter_mut().find(|c| c.id == *id) else { continue };
                    if audio_ready && self.client_audio(client, &mut buf) {
                        gone.push(*id);
                    }
                    if ctrl_ready && self.client_control(client) {
                        gone.push(*id);
                    }
                }
                clients.retain(|c| !gone.contains(&c.id));
            }

            if self.drop_pending.swap(false, Ordering::AcqRel) {
                self.mix.lock().unwrap().clear();
            }

            if self.playback {
                self.pump_mixed(&mut buf);
            } else if fds.last().map(|f| f.revents != 0).unwrap_or(false) {
                self.pump_snoop(&mut buf);
            }

            if !gone.is_empty() && self.client_count() == 0 {
                if let Some(pcm) = self.pcm.upgrade() {
                    if let Some(t) = pcm.transport() {
                        t.stop_if_no_clients();
                    }
                }
            }
        }
    }

    /// Read one chunk of client audio into the mix. Returns true on EOF.
    fn client_audio(&self, client: &mut MultiClient, buf: &mut [u8]) -> bool {
        match sock::read(client.pipe.as_raw_fd(), buf) {
            Ok(0) => true,
            Ok(n) => {
                let mut mix = self.mix.lock().unwrap();
                let frame = mix.frame_bytes();
                // Whole frames only; a trailing partial frame is dropped
                // rather than smeared across channels.
                let usable = n - n % frame;
                let mut consumed = 0;
                while consumed < usable {
                    let taken = mix.add(&mut client.offset, &buf[consumed..usable]);
                    if taken == 0 {
                        break;
                    }
                    consumed += taken * frame;
                }
                false
            }
            Err(err) if err.kind() == IoErrorKind::WouldBlock => false,
            Err(err) if err.kind() == IoErrorKind::Interrupted => false,
            Err(err) => {
                log::warn!("pcm multi client read: {err}");
                true
            }
        }
    }

    /// Serve one control command. Returns true when the client hung up.
    fn client_control(&self, client: &MultiClient) -> bool {
        let mut cmd = [0u8; 32];
        let len = match sock::read(client.ctrl.as_raw_fd(), &mut cmd) {
            Ok(0) => return true,
            Ok(len) => len,
            Err(err) if err.kind() == IoErrorKind::WouldBlock => return false,
            Err(_) => return true,
        };
        use crate::pcm::ControlCommand;
        use std::str::FromStr;
        let reply: &[u8] = match std::str::from_utf8(&cmd[..len])
            .ok()
            .and_then(|s| ControlCommand::from_str(s.trim_end()).ok())
        {
            Some(ControlCommand::Drain) => {
                self.drain.store(true, Ordering::Release);
                b"OK"
            }
            Some(ControlCommand::Drop) => {
                self.drop_pending.store(true, Ordering::Release);
                b"OK"
            }
            Some(ControlCommand::Pause) | Some(ControlCommand::Resume) => b"OK",
            Some(ControlCommand::Open) | Some(ControlCommand::Close) => b"OK",
            None => b"Invalid",
        };
        let _ = sock::write(client.ctrl.as_raw_fd(), reply);
        false
    }

    /// Move mixed audio into the internal pipe once the start threshold is
    /// reached (or unconditionally while draining).
    fn pump_mixed(&self, buf: &mut [u8]) {
        let scales = self.scales();
        loop {
            let mut mix = self.mix.lock().unwrap();
            if !mix.at_threshold() && !self.drain.load(Ordering::Acquire) {
                return;
            }
            let frame = mix.frame_bytes();
            let frames = mix.read(buf, &scales);
            drop(mix);
            if frames == 0 {
                self.drain.store(false, Ordering::Release);
                return;
            }
            match sock::write(self.internal.as_raw_fd(), &buf[..frames * frame]) {
                Ok(_) => (),
                Err(err) if err.kind() == IoErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    /// Fan captured audio out to every client; each one sees the same
    /// snoop slice, and a stalled client loses audio rather than stalling
    /// the others.
    fn pump_snoop(&self, buf: &mut [u8]) {
        loop {
            let n = match sock::read(self.internal.as_raw_fd(), buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            let clients = self.clients.lock().unwrap();
            for client in clients.iter() {
                let _ = sock::write(client.pipe.as_raw_fd(), &buf[..n]);
            }
        }
    }
}

impl Drop for PcmMulti {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = sock::write(self.event.as_raw_fd(), &1u64.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        transport::test::a2dp_sink_transport,
    };

    #[test]
    fn clients_join_and_leave() {
        let t = a2dp_sink_transport(Config::default());
        // The sink-mode PCM of an A2DP sink transport is the back channel;
        // multi-client playback applies there.
        let pcm = t.pcm_bc().clone();
        let multi = PcmMulti::start(&pcm).unwrap();
        assert_eq!(multi.client_count(), 0);

        let (a_fd, _a_ctrl) = pcm.open().unwrap();
        let (b_fd, _b_ctrl) = pcm.open().unwrap();
        assert_eq!(multi.client_count(), 2);

        drop(a_fd);
        drop(b_fd);
        // The worker notices EOF on its next wake-up.
        for _ in 0..50 {
            if multi.client_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(multi.client_count(), 0);
        multi.shutdown();
        t.destroy();
    }

    #[test]
    fn playback_flows_through_the_splice() {
        let t = a2dp_sink_transport(Config::default());
        let pcm = t.pcm_bc().clone();
        let multi = PcmMulti::start(&pcm).unwrap();
        let frame = multi.mix.lock().unwrap().frame_bytes();
        let period = multi.mix.lock().unwrap().period();

        // A single client at unity scale reproduces its input; the summing
        // arithmetic itself is covered by the mix buffer tests.
        let (a_fd, _a_ctrl) = pcm.open().unwrap();
        let samples: Vec<u8> =
            std::iter::repeat(1000i16.to_le_bytes()).take(3 * period * frame / 2).flatten().collect();
        assert_eq!(sock::write(a_fd.as_raw_fd(), &samples).unwrap(), samples.len());

        // The transport worker side of the splice: mixed audio appears on
        // the PCM descriptor once the start threshold is passed.
        let mut out = vec![0u8; period * frame];
        let mut collected = Vec::new();
        for _ in 0..200 {
            match pcm.read(&mut out) {
                Ok(n) => collected.extend_from_slice(&out[..n]),
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(err) => panic!("read: {err}"),
            }
            if collected.len() >= period * frame {
                break;
            }
        }
        assert!(collected.len() >= period * frame);
        for chunk in collected.chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([chunk[0], chunk[1]]), 1000);
        }

        drop(a_fd);
        multi.shutdown();
        t.destroy();
    }
}
