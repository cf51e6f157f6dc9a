//! HFP/HSP voice links: RFCOMM coupling and codec selection.

use std::{
    sync::{mpsc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    config::RuntimeState,
    transport::{CodecId, Profile, Transport},
    Error, ErrorKind, Result,
};

/// Signal sent to the RFCOMM worker serving this transport.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RfcommSignal {
    /// Wake the worker.
    Ping,
    /// Negotiate the given codec with the remote.
    SelectCodec(CodecId),
    /// Report the local volume to the remote.
    UpdateVolume,
    /// Report the host battery level to the remote.
    UpdateBattery,
}

/// Handle of the RFCOMM worker attached to a SCO transport.
///
/// The AT command machinery itself lives outside the core; the core only
/// exchanges signals with it and observes the codec id it installs through
/// [Transport::codec_updated].
#[derive(Debug)]
pub struct RfcommLink {
    tx: mpsc::Sender<RfcommSignal>,
    codec_selection: bool,
}

impl RfcommLink {
    /// Couple an RFCOMM worker. `codec_selection` reports whether both
    /// sides support the HFP codec negotiation feature.
    pub fn new(tx: mpsc::Sender<RfcommSignal>, codec_selection: bool) -> Self {
        Self { tx, codec_selection }
    }

    /// Whether HFP codec negotiation is available on this link.
    pub fn codec_selection(&self) -> bool {
        self.codec_selection
    }

    /// Send a signal to the worker.
    pub fn send(&self, signal: RfcommSignal) -> Result<()> {
        self.tx.send(signal).map_err(|_| Error::new(ErrorKind::NoSuchThread))
    }
}

/// SCO-specific transport data.
#[derive(Debug)]
pub struct ScoData {
    rfcomm: Mutex<Option<RfcommLink>>,
    /// Time of the last SCO socket close. Some controllers reject a connect
    /// immediately following a close; the acquire path honours a minimum
    /// close-to-connect spacing.
    closed_at: Mutex<Option<Instant>>,
    /// Serializes codec selection requests from clients.
    select_mtx: Mutex<()>,
    ofono_card: Option<String>,
    ofono_modem: Option<String>,
}

impl ScoData {
    /// SCO data with an attached RFCOMM worker.
    pub fn new(rfcomm: Option<RfcommLink>) -> Self {
        Self {
            rfcomm: Mutex::new(rfcomm),
            closed_at: Mutex::new(None),
            select_mtx: Mutex::new(()),
            ofono_card: None,
            ofono_modem: None,
        }
    }

    /// SCO data for an oFono managed link; codec selection is out of our
    /// hands there.
    pub fn new_ofono(card: String, modem: String) -> Self {
        Self {
            rfcomm: Mutex::new(None),
            closed_at: Mutex::new(None),
            select_mtx: Mutex::new(()),
            ofono_card: Some(card),
            ofono_modem: Some(modem),
        }
    }

    /// oFono card path, if any.
    pub fn ofono_card(&self) -> Option<&str> {
        self.ofono_card.as_deref()
    }

    /// oFono modem path, if any.
    pub fn ofono_modem(&self) -> Option<&str> {
        self.ofono_modem.as_deref()
    }

    /// Attach or replace the RFCOMM worker handle.
    pub fn set_rfcomm(&self, link: Option<RfcommLink>) {
        *self.rfcomm.lock().unwrap() = link;
    }

    fn codec_selection_possible(&self, profile: Profile) -> bool {
        matches!(profile, Profile::HfpHf | Profile::HfpAg)
            && self.rfcomm.lock().unwrap().as_ref().map(|r| r.codec_selection()).unwrap_or(false)
    }

    /// Initial codec for a freshly created transport: HFP with codec
    /// selection starts undefined, everything else is stuck with CVSD.
    pub(crate) fn initial_codec(&self, profile: Profile) -> CodecId {
        if self.codec_selection_possible(profile) {
            CodecId::Undefined
        } else {
            CodecId::Cvsd
        }
    }

    pub(crate) fn codec_list(&self, profile: Profile, runtime: &RuntimeState) -> Vec<CodecId> {
        let mut codecs = vec![CodecId::Cvsd];
        if self.codec_selection_possible(profile) {
            if runtime.hfp_msbc() {
                codecs.push(CodecId::Msbc);
            }
            if runtime.hfp_lc3_swb() {
                codecs.push(CodecId::Lc3Swb);
            }
        }
        codecs
    }

    pub(crate) fn signal_rfcomm(&self, signal: RfcommSignal) {
        if let Some(link) = self.rfcomm.lock().unwrap().as_ref() {
            if let Err(err) = link.send(signal) {
                log::warn!("RFCOMM signal {signal:?}: {err}");
            }
        }
    }

    pub(crate) fn mark_closed(&self, at: Instant) {
        *self.closed_at.lock().unwrap() = Some(at);
    }

    /// Sleep out the remainder of the close-to-connect grace period.
    pub(crate) fn close_connect_wait(&self, grace: Duration) {
        let closed_at = *self.closed_at.lock().unwrap();
        if let Some(closed_at) = closed_at {
            let elapsed = closed_at.elapsed();
            if elapsed < grace {
                std::thread::sleep(grace - elapsed);
            }
        }
    }
}

impl Transport {
    /// HFP codec selection handshake.
    ///
    /// The negotiation itself runs on the RFCOMM worker; this call stops
    /// audio, hands the request over, and waits (bounded) for the worker to
    /// install the confirmed codec via [Transport::codec_updated].
    pub(crate) fn select_codec_sco(self: &std::sync::Arc<Self>, sco: &ScoData, codec: CodecId) -> Result<()> {
        if !matches!(codec, CodecId::Cvsd | CodecId::Msbc | CodecId::Lc3Swb) {
            return Err(Error::new(ErrorKind::InvalidArguments));
        }

        let _select = sco.select_mtx.lock().unwrap();

        if self.codec() == codec {
            return Ok(());
        }

        // For HSP and for HFP without the codec negotiation feature the
        // only codec is CVSD; there is nothing to select.
        if !sco.codec_selection_possible(self.profile()) {
            return Err(Error::new(ErrorKind::NotSupported));
        }

        let previous = self.codec();

        // No audio may flow while the link codec is in flux.
        self.stop();
        self.pcm().release();
        self.pcm_bc().release();

        sco.rfcomm
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotSupported))?
            .send(RfcommSignal::SelectCodec(codec))?;

        // The worker confirms by updating the codec id; a peer that never
        // answers must not wedge this thread.
        let deadline = Instant::now() + self.config.codec_select_timeout;
        let mut current = self.codec.lock().unwrap();
        while *current == previous {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut));
            }
            let (guard, _res) = self.codec_cond.wait_timeout(current, deadline - now).unwrap();
            current = guard;
        }
        if *current != codec {
            return Err(Error::with_message(
                ErrorKind::Failed,
                format!("codec selection ended with {} instead of {}", *current, codec),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        transport::{
            test::{stub_acquire, stub_release, test_device},
            TransportCreate, TransportData,
        },
    };
    use std::sync::Arc;

    fn hfp_transport(config: Config, rfcomm: Option<RfcommLink>) -> Arc<Transport> {
        let device = test_device(config);
        Transport::new(TransportCreate {
            device,
            owner: ":1.7".into(),
            path: "/org/bluez/hci0/dev_BC_9A_78_56_34_12/hfp".into(),
            profile: Profile::HfpAg,
            data: TransportData::Sco(ScoData::new(rfcomm)),
            acquire: stub_acquire(),
            release: stub_release(),
            remote_volume: None,
        })
        .unwrap()
    }

    #[test]
    fn codec_selection_happy_path() {
        let (tx, rx) = mpsc::channel();
        let t = hfp_transport(Config::default(), Some(RfcommLink::new(tx, true)));
        assert_eq!(t.codec(), CodecId::Undefined);

        // RFCOMM worker stub: confirm whatever is requested.
        let worker_t = t.clone();
        let worker = std::thread::spawn(move || {
            if let Ok(RfcommSignal::SelectCodec(codec)) = rx.recv() {
                worker_t.codec_updated(codec);
            }
        });

        t.select_codec(CodecId::Msbc).unwrap();
        assert_eq!(t.codec(), CodecId::Msbc);
        assert_eq!(t.pcm().params().rate, 16000);
        // Selecting the current codec again is a no-op.
        t.select_codec(CodecId::Msbc).unwrap();
        worker.join().unwrap();
        t.destroy();
    }

    #[test]
    fn codec_selection_without_rfcomm() {
        let t = hfp_transport(Config::default(), None);
        assert_eq!(t.codec(), CodecId::Cvsd);
        let err = t.select_codec(CodecId::Msbc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
        assert_eq!(t.codec(), CodecId::Cvsd);
        t.destroy();
    }

    #[test]
    fn codec_selection_times_out() {
        let mut config = Config::default();
        config.codec_select_timeout = Duration::from_millis(50);
        let (tx, _rx) = mpsc::channel();
        let t = hfp_transport(config, Some(RfcommLink::new(tx, true)));
        let begin = Instant::now();
        let err = t.select_codec(CodecId::Msbc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimedOut);
        assert!(begin.elapsed() >= Duration::from_millis(50));
        t.destroy();
    }

    #[test]
    fn close_connect_quirk_delays_acquire() {
        let mut config = Config::default();
        config.sco_close_connect_grace = Duration::from_millis(120);
        let t = hfp_transport(config, None);
        t.acquire().unwrap();
        let closed = Instant::now();
        t.release().unwrap();
        t.acquire().unwrap();
        assert!(closed.elapsed() >= Duration::from_millis(120));
        t.destroy();
    }
}
