//! Per-transport supervisor thread.
//!
//! Worker threads are never torn down from arbitrary contexts. All
//! asynchronous cancellation requests funnel through one supervisor thread
//! per transport, which serializes them over a command pipe and enforces
//! the keep-alive grace period.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    os::unix::io::AsRawFd,
    sync::{Mutex, Weak},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    sock::{self, OwnedFd},
    transport::Transport,
    Error, ErrorKind, Result,
};

/// Supervisor commands, delivered over the command pipe.
#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Exit the supervisor.
    Terminate = 1,
    /// Synchronously cancel both worker threads.
    CancelThreads = 2,
    /// Arm the keep-alive timer; cancel when no PCM client remains.
    CancelIfNoClients = 3,
}

/// Supervisor thread handle.
pub struct ThreadManager {
    tx: Mutex<Option<OwnedFd>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadManager {
    /// Spawn the supervisor for the given transport.
    pub(crate) fn start(transport: Weak<Transport>, keep_alive: Duration) -> Result<Self> {
        let (rx, tx) = sock::pipe()?;
        let join = std::thread::Builder::new()
            .name("ba-manager".into())
            .spawn(move || manager_loop(transport, rx, keep_alive))
            .map_err(Error::from)?;
        Ok(Self { tx: Mutex::new(Some(tx)), join: Mutex::new(Some(join)) })
    }

    /// Enqueue a command.
    pub fn send(&self, cmd: Command) -> Result<()> {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(fd) => loop {
                match sock::write(fd.as_raw_fd(), &[cmd as u8]) {
                    Ok(_) => return Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            },
            None => Err(Error::new(ErrorKind::NoSuchThread)),
        }
    }

    /// Terminate the supervisor and join it. Idempotent.
    pub fn terminate(&self) {
        let _ = self.send(Command::Terminate);
        *self.tx.lock().unwrap() = None;
        if let Some(join) = self.join.lock().unwrap().take() {
            if join.thread().id() != std::thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn manager_loop(transport: Weak<Transport>, rx: OwnedFd, keep_alive: Duration) {
    let mut armed: Option<Instant> = None;
    loop {
        let timeout = match armed {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => None,
        };
        let mut fds = [sock::poll_in(rx.as_raw_fd())];
        match sock::poll(&mut fds, timeout) {
            Ok(0) => {
                // Keep-alive expired: recheck the client situation and tear
                // the workers down only if every FIFO is still closed.
                armed = None;
                if let Some(t) = transport.upgrade() {
                    t.reap_if_no_clients();
                }
                continue;
            }
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("transport supervisor poll: {err}");
                break;
            }
        }
        let mut buf = [0u8; 1];
        let cmd = match sock::read(rx.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(_) => Command::from_u8(buf[0]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("transport supervisor read: {err}");
                break;
            }
        };
        match cmd {
            Some(Command::Terminate) => break,
            Some(Command::CancelThreads) => {
                armed = None;
                if let Some(t) = transport.upgrade() {
                    t.cancel_worker_threads();
                }
            }
            Some(Command::CancelIfNoClients) => {
                if keep_alive.is_zero() {
                    if let Some(t) = transport.upgrade() {
                        t.reap_if_no_clients();
                    }
                } else {
                    armed = Some(Instant::now() + keep_alive);
                }
            }
            None => log::warn!("transport supervisor: unknown command {}", buf[0]),
        }
    }
}
