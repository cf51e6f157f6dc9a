//! Transport IO worker threads.
//!
//! Every transport owns two workers, an encoder and a decoder. A worker is
//! represented by an [IoThread] which exists for the whole lifetime of the
//! transport; the OS thread behind it comes and goes as the transport is
//! acquired and released. Workers observe the state machine
//!
//! ```text
//! Terminated → Idle → Starting → Running → Stopping → Joining → Terminated
//! ```
//!
//! with three shortcuts: `Terminated → Idle` (restart of a retained
//! transport), `Idle → Terminated` and `Starting → Terminated` (the thread
//! never actually ran). Any other backward move is rejected.
//!
//! Cancellation is cooperative. A worker blocks only in `poll` over its data
//! descriptor and its self-pipe; a stop request raises the stop flag and
//! wakes the pipe, and the worker unwinds through its scope guard.

use libc::pollfd;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    os::unix::io::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use strum::Display;

use crate::{
    sock::{self, OwnedFd},
    BaEvent, Error, ErrorKind, EventSender, PcmProperty, Result,
};

/// Worker thread state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[repr(u8)]
pub enum ThreadState {
    /// No OS thread exists.
    Terminated = 0,
    /// Ready to be started.
    Idle = 1,
    /// OS thread is being brought up.
    Starting = 2,
    /// The codec loop is running.
    Running = 3,
    /// Stop requested; the loop is unwinding.
    Stopping = 4,
    /// The supervisor is joining the OS thread.
    Joining = 5,
}

/// Cross-thread signal delivered through the worker self-pipe.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, FromPrimitive)]
#[repr(u8)]
pub enum Signal {
    /// Wake the poll loop without further meaning.
    Ping = 1,
    /// A PCM client attached.
    PcmOpen = 2,
    /// A PCM client detached.
    PcmClose = 3,
    /// Client requested pause.
    PcmPause = 4,
    /// Client requested resume.
    PcmResume = 5,
    /// Client requested a drain synchronization point.
    PcmSync = 6,
    /// Client requested dropping of buffered samples.
    PcmDrop = 7,
}

/// What woke the worker poll loop.
#[derive(Debug)]
pub enum IoEvent {
    /// A signal arrived on the self-pipe.
    Signal(Signal),
    /// The data descriptor is readable.
    Ready,
    /// The poll timed out.
    Timeout,
}

/// One transport IO worker.
pub struct IoThread {
    name: &'static str,
    /// The master worker releases the whole transport on exit.
    pub(crate) master: AtomicBool,
    state: Mutex<ThreadState>,
    cond: Condvar,
    stop: AtomicBool,
    sig_tx: Mutex<Option<OwnedFd>>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
    drain: Mutex<bool>,
    drain_cond: Condvar,
    pcm_path: String,
    events: EventSender,
}

impl IoThread {
    pub(crate) fn new(name: &'static str, pcm_path: String, events: EventSender) -> Self {
        Self {
            name,
            master: AtomicBool::new(false),
            state: Mutex::new(ThreadState::Terminated),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            sig_tx: Mutex::new(None),
            join: Mutex::new(None),
            drain: Mutex::new(false),
            drain_cond: Condvar::new(),
            pcm_path,
            events,
        }
    }

    /// Short worker name, `enc` or `dec`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.signal_raw(Signal::Ping);
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    /// Move the state machine, validating the transition.
    ///
    /// Transitions into or out of [ThreadState::Running] notify the D-Bus
    /// front end about the changed `Running` property. Every accepted move
    /// wakes all state waiters.
    pub fn state_set(&self, new: ThreadState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let old = *state;
        if old == new {
            return Ok(());
        }
        let legal = new > old
            || matches!(
                (old, new),
                (ThreadState::Terminated, ThreadState::Idle)
                    | (ThreadState::Idle, ThreadState::Terminated)
                    | (ThreadState::Starting, ThreadState::Terminated)
            );
        if !legal {
            return Err(Error::with_message(
                ErrorKind::InvalidState,
                format!("{} worker: {} -> {}", self.name, old, new),
            ));
        }
        log::debug!("{}: {} worker state {} -> {}", self.pcm_path, self.name, old, new);
        *state = new;
        drop(state);
        self.cond.notify_all();
        if old == ThreadState::Running || new == ThreadState::Running {
            let _ = self.events.send(BaEvent::PcmPropertyChanged {
                path: self.pcm_path.clone(),
                property: PcmProperty::Running(new == ThreadState::Running),
            });
        }
        Ok(())
    }

    /// Block until the state satisfies the predicate or the timeout expires.
    ///
    /// Returns the state seen last.
    pub fn state_wait(
        &self, mut pred: impl FnMut(ThreadState) -> bool, timeout: Option<Duration>,
    ) -> ThreadState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if pred(*state) {
                return *state;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return *state;
                    }
                    let (guard, _res) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
                None => state = self.cond.wait(state).unwrap(),
            }
        }
    }

    /// Send a signal to the running worker.
    ///
    /// Fails with [ErrorKind::NoSuchThread] unless the worker is Running.
    pub fn signal_send(&self, sig: Signal) -> Result<()> {
        if self.state() != ThreadState::Running {
            return Err(Error::new(ErrorKind::NoSuchThread));
        }
        self.signal_raw(sig)
    }

    fn signal_raw(&self, sig: Signal) -> Result<()> {
        let tx = self.sig_tx.lock().unwrap();
        match tx.as_ref() {
            Some(fd) => loop {
                match sock::write(fd.as_raw_fd(), &[sig as u8]) {
                    Ok(_) => return Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            },
            None => Err(Error::new(ErrorKind::NoSuchThread)),
        }
    }

    pub(crate) fn install_pipe(&self, tx: OwnedFd) {
        *self.sig_tx.lock().unwrap() = Some(tx);
    }

    pub(crate) fn remove_pipe(&self) {
        *self.sig_tx.lock().unwrap() = None;
    }

    /// Enter a drain synchronization: raise the drain flag and wait for the
    /// worker to clear it after flushing buffered audio. Returns early when
    /// the worker leaves the Running state.
    pub(crate) fn drain_wait(&self) -> Result<()> {
        let mut drain = self.drain.lock().unwrap();
        *drain = true;
        drop(drain);
        match self.signal_send(Signal::PcmSync) {
            Ok(()) => (),
            // Nothing is running, so nothing is buffered either.
            Err(Error { kind: ErrorKind::NoSuchThread, .. }) => {
                *self.drain.lock().unwrap() = false;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        let mut drain = self.drain.lock().unwrap();
        while *drain {
            if self.state() != ThreadState::Running {
                *drain = false;
                break;
            }
            let (guard, _res) = self.drain_cond.wait_timeout(drain, Duration::from_millis(100)).unwrap();
            drain = guard;
        }
        Ok(())
    }

    /// Worker side: report that buffered audio has been flushed.
    pub fn drain_complete(&self) {
        let mut drain = self.drain.lock().unwrap();
        if *drain {
            *drain = false;
            self.drain_cond.notify_all();
        }
    }

    /// Whether a drain synchronization is pending.
    pub fn drain_pending(&self) -> bool {
        *self.drain.lock().unwrap()
    }
}

/// Worker-thread context handed to the codec loop body.
pub struct IoWorker {
    /// The worker this OS thread runs for.
    pub thread: std::sync::Arc<IoThread>,
    /// Duplicate of the transport Bluetooth socket, private to this thread.
    pub bt_fd: OwnedFd,
    sig_rx: OwnedFd,
}

impl IoWorker {
    pub(crate) fn new(thread: std::sync::Arc<IoThread>, bt_fd: OwnedFd, sig_rx: OwnedFd) -> Self {
        Self { thread, bt_fd, sig_rx }
    }

    /// Read one pending signal off the self-pipe.
    pub fn signal_recv(&self) -> Result<Signal> {
        let mut buf = [0u8; 1];
        loop {
            match sock::read(self.sig_rx.as_raw_fd(), &mut buf) {
                Ok(0) => return Err(Error::new(ErrorKind::NoSuchThread)),
                Ok(_) => {
                    return Signal::from_u8(buf[0])
                        .ok_or_else(|| Error::new(ErrorKind::Internal(crate::InternalErrorKind::InvalidValue)))
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Block in `poll` over the self-pipe and an optional data descriptor.
    ///
    /// Stop requests win over everything else: when the stop flag is raised
    /// the call returns `Err(Stopping)` and the loop body is expected to
    /// unwind. `data` may be `-1` to wait for signals only.
    pub fn wait(&self, data: RawFd, timeout: Option<Duration>) -> Result<IoEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.thread.stop_requested() {
                return Err(Error::new(ErrorKind::Stopping));
            }
            let mut fds: [pollfd; 2] = [sock::poll_in(self.sig_rx.as_raw_fd()), sock::poll_in(data)];
            let nfds = if data >= 0 { 2 } else { 1 };
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(IoEvent::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match sock::poll(&mut fds[..nfds], timeout) {
                Ok(0) => return Ok(IoEvent::Timeout),
                Ok(_) => {
                    if self.thread.stop_requested() {
                        return Err(Error::new(ErrorKind::Stopping));
                    }
                    if fds[0].revents != 0 {
                        return Ok(IoEvent::Signal(self.signal_recv()?));
                    }
                    return Ok(IoEvent::Ready);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null_events;
    use std::sync::Arc;

    fn thread() -> IoThread {
        IoThread::new("enc", "/test/pcm".into(), null_events())
    }

    #[test]
    fn forward_transitions_are_legal() {
        let t = thread();
        for s in [
            ThreadState::Idle,
            ThreadState::Starting,
            ThreadState::Running,
            ThreadState::Stopping,
            ThreadState::Joining,
        ] {
            t.state_set(s).unwrap();
        }
        // Wrap back for restart.
        t.state_set(ThreadState::Terminated).unwrap();
        t.state_set(ThreadState::Idle).unwrap();
    }

    #[test]
    fn shortcut_transitions_are_legal() {
        let t = thread();
        t.state_set(ThreadState::Idle).unwrap();
        t.state_set(ThreadState::Terminated).unwrap();
        t.state_set(ThreadState::Idle).unwrap();
        t.state_set(ThreadState::Starting).unwrap();
        // Init failure path.
        t.state_set(ThreadState::Stopping).unwrap();
        t.state_set(ThreadState::Terminated).unwrap();
        t.state_set(ThreadState::Idle).unwrap();
        t.state_set(ThreadState::Starting).unwrap();
        // Thread never started.
        t.state_set(ThreadState::Terminated).unwrap();
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let t = thread();
        t.state_set(ThreadState::Idle).unwrap();
        t.state_set(ThreadState::Starting).unwrap();
        t.state_set(ThreadState::Running).unwrap();
        assert_eq!(t.state_set(ThreadState::Idle).unwrap_err().kind, ErrorKind::InvalidState);
        assert_eq!(t.state_set(ThreadState::Starting).unwrap_err().kind, ErrorKind::InvalidState);
        t.state_set(ThreadState::Stopping).unwrap();
        assert_eq!(t.state_set(ThreadState::Running).unwrap_err().kind, ErrorKind::InvalidState);
    }

    #[test]
    fn signal_requires_running_worker() {
        let t = Arc::new(thread());
        assert_eq!(t.signal_send(Signal::Ping).unwrap_err().kind, ErrorKind::NoSuchThread);
    }

    #[test]
    fn signal_round_trip_through_pipe() {
        let t = Arc::new(thread());
        let (rx, tx) = crate::sock::pipe().unwrap();
        t.install_pipe(tx);
        t.state_set(ThreadState::Idle).unwrap();
        t.state_set(ThreadState::Starting).unwrap();
        t.state_set(ThreadState::Running).unwrap();
        t.signal_send(Signal::PcmPause).unwrap();
        let w = IoWorker::new(t.clone(), crate::sock::pipe().unwrap().0, rx);
        match w.wait(-1, Some(Duration::from_millis(100))).unwrap() {
            IoEvent::Signal(Signal::PcmPause) => (),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
