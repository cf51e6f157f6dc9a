//! End-to-end transport engine scenarios.
//!
//! These tests run the real worker threads against stubbed Bluetooth
//! sockets: the acquire callback hands out one half of a socket pair and
//! parks the other half for the test to inspect.

use bluealsa::{
    codec,
    pcm::StreamFormat,
    thread::ThreadState,
    transport::{
        A2dpData, A2dpState, CodecId, Profile, Transport, TransportCreate, TransportData,
    },
    Adapter, Config, OwnedFd,
};
use std::{
    os::unix::io::AsRawFd,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
    let mut sv: [libc::c_int; 2] = [0; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_LOCAL,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            sv.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair: {}", std::io::Error::last_os_error());
    unsafe { (OwnedFd::new(sv[0]), OwnedFd::new(sv[1])) }
}

/// The far end of the most recently acquired Bluetooth socket.
type PeerSlot = Arc<Mutex<Option<OwnedFd>>>;

fn a2dp_source_transport(config: Config) -> (Arc<Transport>, PeerSlot) {
    let adapter = Adapter::standalone(0, config);
    let device = adapter.device_get_or_create("12:34:56:78:9A:BC".parse().unwrap());
    let peer: PeerSlot = Arc::new(Mutex::new(None));
    let acquire_peer = peer.clone();
    let transport = Transport::new(TransportCreate {
        device,
        owner: ":1.42".into(),
        path: "/org/bluez/hci0/dev_BC_9A_78_56_34_12/fd0".into(),
        profile: Profile::A2dpSource,
        data: TransportData::A2dp(A2dpData::new(
            "/org/bluez/hci0/dev_BC_9A_78_56_34_12/sep1".into(),
            codec::a2dp_codec_info(CodecId::Sbc).unwrap(),
            // SBC configuration: 44100 Hz, stereo.
            vec![0x22, 0x15, 2, 53],
            A2dpState::Idle,
        )),
        acquire: Box::new(move |_kind| {
            let (ours, theirs) = seqpacket_pair();
            *acquire_peer.lock().unwrap() = Some(theirs);
            Ok(bluealsa::transport::BtAcquired { fd: ours, mtu_read: 48, mtu_write: 48 })
        }),
        release: Box::new(|| Ok(())),
        remote_volume: None,
    })
    .unwrap();
    (transport, peer)
}

fn wait_for(what: &str, timeout: Duration, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn read_with_timeout(fd: &OwnedFd, buf: &mut [u8], timeout: Duration) -> usize {
    let mut fds =
        [libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLIN, revents: 0 }];
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout.as_millis() as libc::c_int) };
    assert!(ready > 0, "timeout waiting for socket data");
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
    assert!(n >= 0, "read: {}", std::io::Error::last_os_error());
    n as usize
}

fn write_all(fd: &OwnedFd, buf: &[u8]) {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe {
            libc::write(fd.as_raw_fd(), buf[off..].as_ptr() as *const _, buf.len() - off)
        };
        assert!(n > 0, "write: {}", std::io::Error::last_os_error());
        off += n as usize;
    }
}

#[test]
fn a2dp_open_stream_close_and_reopen() {
    let mut config = Config::default();
    config.keep_alive = Duration::from_millis(150);
    let (t, peer) = a2dp_source_transport(config);

    // The negotiated SBC configuration defines the stream parameters.
    let params = t.pcm().params();
    assert_eq!(params.format, StreamFormat::S16_2LE);
    assert_eq!(params.channels, 2);
    assert_eq!(params.rate, 44100);
    assert_eq!(t.codec().to_string(), "SBC");

    t.acquire().unwrap();
    assert!(t.bt_fd() >= 0);
    t.start().unwrap();
    let (pcm_fd, ctrl_fd) = t.pcm().open().unwrap();

    wait_for("encoder running", Duration::from_secs(2), || {
        t.thread_enc().state() == ThreadState::Running
    });

    // Playback audio crosses from the client FIFO to the Bluetooth socket
    // in write-MTU sized packets.
    let audio: Vec<u8> = (0..480u32).map(|i| i as u8).collect();
    write_all(&pcm_fd, &audio);
    let bt = peer.lock().unwrap().take().unwrap();
    let mut collected = Vec::new();
    let mut packet = [0u8; 64];
    while collected.len() < audio.len() {
        let n = read_with_timeout(&bt, &mut packet, Duration::from_secs(2));
        assert_eq!(n, 48, "encoder must write whole MTU-sized packets");
        collected.extend_from_slice(&packet[..n]);
    }
    assert_eq!(collected, audio);

    // Client EOF trips the keep-alive reaper: within the grace period the
    // workers terminate, the socket is released and the stopping flag is
    // back to false.
    drop(pcm_fd);
    drop(ctrl_fd);
    wait_for("keep-alive teardown", Duration::from_millis(150 + 2000), || {
        t.thread_enc().state() == ThreadState::Terminated
            && t.thread_dec().state() == ThreadState::Terminated
            && t.bt_fd() == -1
    });
    assert!(!t.is_stopping());

    // A subsequent open succeeds and re-acquires the socket.
    t.acquire().unwrap();
    t.start().unwrap();
    let (pcm_fd2, _ctrl_fd2) = t.pcm().open().unwrap();
    wait_for("encoder running again", Duration::from_secs(2), || {
        t.thread_enc().state() == ThreadState::Running
    });
    assert!(t.bt_fd() >= 0);
    drop(pcm_fd2);

    t.destroy();
    assert_eq!(t.bt_fd(), -1);
}

#[test]
fn worker_states_progress_monotonically() {
    let mut config = Config::default();
    config.keep_alive = Duration::from_millis(50);
    let (t, _peer) = a2dp_source_transport(config);

    t.acquire().unwrap();
    t.start().unwrap();

    let thread = t.thread_enc().clone();
    let done = Arc::new(Mutex::new(false));
    let sampler_done = done.clone();
    let sampler = std::thread::spawn(move || {
        let mut states = vec![thread.state()];
        while !*sampler_done.lock().unwrap() {
            let state = thread.state();
            if *states.last().unwrap() != state {
                states.push(state);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        states
    });

    let (pcm_fd, _ctrl) = t.pcm().open().unwrap();
    wait_for("running", Duration::from_secs(2), || {
        t.thread_enc().state() == ThreadState::Running
    });
    drop(pcm_fd);
    wait_for("terminated", Duration::from_secs(3), || {
        t.thread_enc().state() == ThreadState::Terminated
    });

    *done.lock().unwrap() = true;
    let states = sampler.join().unwrap();
    // Any observed sequence must be a subsequence of the forward state
    // order; the only wrap is the Terminated -> Idle restart.
    for pair in states.windows(2) {
        let legal = pair[1] > pair[0]
            || (pair[0] == ThreadState::Terminated && pair[1] == ThreadState::Idle);
        assert!(legal, "illegal observed transition {:?} -> {:?} in {:?}", pair[0], pair[1], states);
    }
    t.destroy();
}

#[test]
fn controller_socket_commands() {
    let (t, _peer) = a2dp_source_transport(Config::default());
    t.acquire().unwrap();
    t.start().unwrap();
    let (_pcm_fd, ctrl_fd) = t.pcm().open().unwrap();
    wait_for("running", Duration::from_secs(2), || {
        t.thread_enc().state() == ThreadState::Running
    });
    assert!(t.pcm().is_active());

    let mut reply = [0u8; 16];

    write_all(&ctrl_fd, b"PAUSE");
    let n = read_with_timeout(&ctrl_fd, &mut reply, Duration::from_secs(2));
    assert_eq!(&reply[..n], b"OK");
    assert!(!t.pcm().is_active());

    write_all(&ctrl_fd, b"RESUME");
    let n = read_with_timeout(&ctrl_fd, &mut reply, Duration::from_secs(2));
    assert_eq!(&reply[..n], b"OK");
    assert!(t.pcm().is_active());

    write_all(&ctrl_fd, b"DROP");
    let n = read_with_timeout(&ctrl_fd, &mut reply, Duration::from_secs(2));
    assert_eq!(&reply[..n], b"OK");

    // Drain on an empty stream completes immediately.
    write_all(&ctrl_fd, b"DRAIN");
    let n = read_with_timeout(&ctrl_fd, &mut reply, Duration::from_secs(2));
    assert_eq!(&reply[..n], b"OK");

    write_all(&ctrl_fd, b"FLUSH");
    let n = read_with_timeout(&ctrl_fd, &mut reply, Duration::from_secs(2));
    assert_eq!(&reply[..n], b"Invalid");

    t.destroy();
}

#[test]
fn second_client_is_rejected_without_multi() {
    let (t, _peer) = a2dp_source_transport(Config::default());
    t.acquire().unwrap();
    t.start().unwrap();
    let (_pcm_fd, _ctrl_fd) = t.pcm().open().unwrap();
    let err = t.pcm().open().unwrap_err();
    assert_eq!(err.kind, bluealsa::ErrorKind::Busy);
    t.destroy();
}
