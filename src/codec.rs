//! Codec collaborator contract.
//!
//! Frame coding itself (SBC, mSBC, AAC, aptX, LDAC, LC3) lives outside the
//! core. What the core owns is the contract every codec module plugs into:
//! `transport_init` derives the PCM stream parameters from the negotiated
//! transport configuration, and `transport_start` spawns the encoder and
//! decoder workers with the direction swap between A2DP source/sink and
//! between the HFP/HSP gateway and hands-free roles.
//!
//! The worker bodies provided here move raw PCM frames between the client
//! FIFO and the Bluetooth socket in MTU-sized chunks. This is the real
//! data path for CVSD (which is PCM passthrough on a properly configured
//! SCO socket) and the scaffold the external frame coders run inside.

use std::{
    os::unix::io::AsRawFd,
    sync::Arc,
    time::Duration,
};

use crate::{
    pcm::{PcmMode, PcmParams, StreamFormat, TransportPcm},
    sock,
    thread::{IoEvent, IoWorker, Signal, ThreadState},
    transport::{CodecId, Profile, Transport, TransportData},
    Error, ErrorKind, Result,
};

/// Descriptor of an A2DP codec.
#[derive(Debug)]
pub struct A2dpCodecInfo {
    /// Codec identity.
    pub id: CodecId,
    /// A2DP media codec id byte; `0xff` for vendor codecs.
    pub media_codec: u8,
    /// Vendor id and vendor codec id for vendor codecs.
    pub vendor: Option<(u32, u16)>,
    /// Whether the codec carries a voice back-channel.
    pub back_channel: bool,
}

static A2DP_CODECS: &[A2dpCodecInfo] = &[
    A2dpCodecInfo { id: CodecId::Sbc, media_codec: 0x00, vendor: None, back_channel: false },
    A2dpCodecInfo { id: CodecId::Mpeg, media_codec: 0x01, vendor: None, back_channel: false },
    A2dpCodecInfo { id: CodecId::Aac, media_codec: 0x02, vendor: None, back_channel: false },
    A2dpCodecInfo { id: CodecId::AptX, media_codec: 0xff, vendor: Some((0x004f, 0x0001)), back_channel: false },
    A2dpCodecInfo { id: CodecId::AptXHd, media_codec: 0xff, vendor: Some((0x00d7, 0x0024)), back_channel: false },
    A2dpCodecInfo {
        id: CodecId::FastStream,
        media_codec: 0xff,
        vendor: Some((0x000a, 0x0001)),
        back_channel: true,
    },
    A2dpCodecInfo { id: CodecId::Ldac, media_codec: 0xff, vendor: Some((0x012d, 0x00aa)), back_channel: false },
];

/// Look up the descriptor of an A2DP codec.
pub fn a2dp_codec_info(id: CodecId) -> Option<&'static A2dpCodecInfo> {
    A2DP_CODECS.iter().find(|c| c.id == id)
}

/// Look up an A2DP codec by its wire identity.
pub fn a2dp_codec_from_media(media_codec: u8, vendor: Option<(u32, u16)>) -> Option<&'static A2dpCodecInfo> {
    A2DP_CODECS.iter().find(|c| c.media_codec == media_codec && c.vendor == vendor)
}

/// Parse the sampling rate and channel count out of an SBC configuration.
fn sbc_config_params(config: &[u8]) -> Option<(u32, u8)> {
    let byte = *config.first()?;
    let rate = match byte & 0xf0 {
        0x80 => 16000,
        0x40 => 32000,
        0x20 => 44100,
        0x10 => 48000,
        _ => return None,
    };
    // Mono is the only single-channel mode; dual/stereo/joint carry two.
    let channels = if byte & 0x0f == 0x08 { 1 } else { 2 };
    Some((rate, channels))
}

/// Parse the aptX / aptX HD configuration nibbles.
fn aptx_config_params(config: &[u8]) -> Option<(u32, u8)> {
    let byte = *config.first()?;
    let rate = match byte & 0xf0 {
        0x80 => 16000,
        0x40 => 32000,
        0x20 => 44100,
        0x10 => 48000,
        _ => return None,
    };
    let channels = if byte & 0x0f == 0x08 { 1 } else { 2 };
    Some((rate, channels))
}

/// Parse the FastStream music/voice direction configuration.
fn faststream_config_params(config: &[u8]) -> Option<(u32, u8)> {
    let music = *config.get(1)?;
    let rate = match music & 0x03 {
        0x01 => 48000,
        0x02 => 44100,
        _ => 44100,
    };
    Some((rate, 2))
}

/// Set the PCM stream parameters from the negotiated transport state.
///
/// Every codec module calls back into this on transport creation and after
/// an HFP codec switch.
pub fn transport_init(t: &Arc<Transport>) -> Result<()> {
    match &t.data {
        TransportData::A2dp(a2dp) => {
            let info = a2dp.codec_info();
            let config = a2dp.configuration();
            let (rate, channels) = match info.id {
                CodecId::Sbc => sbc_config_params(config)
                    .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "bad SBC configuration"))?,
                CodecId::AptX | CodecId::AptXHd => aptx_config_params(config)
                    .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "bad aptX configuration"))?,
                CodecId::FastStream => faststream_config_params(config)
                    .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "bad FastStream configuration"))?,
                // The remaining codecs negotiate their exact parameters in
                // the external coder; the default stereo stream applies.
                _ => (44100, 2),
            };
            t.pcm().set_params(PcmParams { format: StreamFormat::S16_2LE, channels, rate });
            if info.back_channel {
                // FastStream voice back-channel.
                t.pcm_bc().set_params(PcmParams { format: StreamFormat::S16_2LE, channels: 1, rate: 16000 });
            }
            Ok(())
        }
        TransportData::Sco(_) => {
            let rate = match t.codec() {
                CodecId::Msbc => 16000,
                CodecId::Lc3Swb => 32000,
                // CVSD, and the provisional parameters before an HFP codec
                // has been selected.
                _ => 8000,
            };
            let params = PcmParams { format: StreamFormat::S16_2LE, channels: 1, rate };
            t.pcm().set_params(params);
            t.pcm_bc().set_params(params);
            Ok(())
        }
        TransportData::Midi(_) => Ok(()),
    }
}

/// Spawn the encoder and decoder workers for an acquired transport.
///
/// The encoder always serves the sink-mode PCM (client playback) and the
/// decoder the source-mode PCM (client capture); which of the two is the
/// transport's main direction depends on the profile role. The master
/// worker is the one bound to the main direction; it releases the whole
/// transport on exit.
pub fn transport_start(t: &Arc<Transport>) -> Result<()> {
    if t.bt_fd() < 0 {
        return Err(Error::new(ErrorKind::NotAcquired));
    }
    match t.profile() {
        Profile::A2dpSource => {
            spawn_encoder(t, true)?;
            if a2dp_has_back_channel(t) {
                spawn_decoder(t, false)?;
            }
            Ok(())
        }
        Profile::A2dpSink => {
            spawn_decoder(t, true)?;
            if a2dp_has_back_channel(t) {
                spawn_encoder(t, false)?;
            }
            Ok(())
        }
        Profile::HfpAg | Profile::HspAg => {
            spawn_encoder(t, true)?;
            spawn_decoder(t, false)?;
            Ok(())
        }
        Profile::HfpHf | Profile::HspHs => {
            spawn_decoder(t, true)?;
            spawn_encoder(t, false)?;
            Ok(())
        }
        Profile::Midi => Err(Error::new(ErrorKind::NotSupported)),
    }
}

fn a2dp_has_back_channel(t: &Arc<Transport>) -> bool {
    matches!(&t.data, TransportData::A2dp(a2dp) if a2dp.codec_info().back_channel)
}

fn sink_pcm(t: &Arc<Transport>) -> Arc<TransportPcm> {
    if t.pcm().mode() == PcmMode::Sink { t.pcm().clone() } else { t.pcm_bc().clone() }
}

fn source_pcm(t: &Arc<Transport>) -> Arc<TransportPcm> {
    if t.pcm().mode() == PcmMode::Source { t.pcm().clone() } else { t.pcm_bc().clone() }
}

fn spawn_encoder(t: &Arc<Transport>, master: bool) -> Result<()> {
    let pcm = sink_pcm(t);
    let transport = t.clone();
    t.start_io_thread(t.thread_enc(), master, move |w| pcm_enc_worker(w, transport, pcm))
}

fn spawn_decoder(t: &Arc<Transport>, master: bool) -> Result<()> {
    let pcm = source_pcm(t);
    let transport = t.clone();
    t.start_io_thread(t.thread_dec(), master, move |w| pcm_dec_worker(w, transport, pcm))
}

/// Whether a Bluetooth socket error means the link is simply gone.
fn bt_link_down(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNRESET) | Some(libc::ENOTCONN) | Some(libc::EPIPE) | Some(libc::ECONNABORTED)
    )
}

/// Write a full chunk to the Bluetooth socket, polling for writability.
fn bt_write_all(w: &IoWorker, buf: &[u8]) -> std::io::Result<()> {
    let fd = w.bt_fd.as_raw_fd();
    let mut off = 0;
    while off < buf.len() {
        if w.thread.stop_requested() {
            return Err(std::io::Error::from(std::io::ErrorKind::Interrupted));
        }
        match sock::write(fd, &buf[off..]) {
            Ok(n) => off += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                let mut fds = [libc::pollfd { fd, events: libc::POLLOUT, revents: 0 }];
                sock::poll(&mut fds, Some(Duration::from_millis(100)))?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Encoder loop: client FIFO → Bluetooth socket, one write MTU at a time.
fn pcm_enc_worker(w: IoWorker, t: Arc<Transport>, pcm: Arc<TransportPcm>) {
    if w.thread.state_set(ThreadState::Running).is_err() {
        return;
    }
    let (_, mtu_write) = t.mtus();
    let chunk = mtu_write.max(64);
    let mut staging: Vec<u8> = Vec::with_capacity(2 * chunk);
    let mut buf = vec![0u8; chunk];

    loop {
        let data_fd = if pcm.is_active() { pcm.fd() } else { -1 };
        let event = match w.wait(data_fd, None) {
            Ok(event) => event,
            Err(Error { kind: ErrorKind::Stopping, .. }) => return,
            Err(err) => {
                log::error!("{}: encoder wait: {}", pcm.path(), err);
                return;
            }
        };
        match event {
            IoEvent::Signal(Signal::PcmDrop) => {
                // Discard buffered PCM samples; whole frames already staged
                // towards the socket stay, avoiding a mid-frame boundary.
                staging.clear();
            }
            IoEvent::Signal(Signal::PcmSync) => {
                if !staging.is_empty() {
                    if let Err(err) = bt_write_all(&w, &staging) {
                        if !bt_link_down(&err) && err.kind() != std::io::ErrorKind::Interrupted {
                            log::error!("{}: encoder flush: {}", pcm.path(), err);
                        }
                    }
                    staging.clear();
                }
                w.thread.drain_complete();
            }
            IoEvent::Signal(_) => (),
            IoEvent::Timeout => (),
            IoEvent::Ready => {
                match pcm.read(&mut buf) {
                    Ok(0) => {
                        // Client EOF: detach and let the keep-alive reaper
                        // decide about transport teardown.
                        pcm.release();
                    }
                    Ok(n) => {
                        staging.extend_from_slice(&buf[..n]);
                        while staging.len() >= chunk {
                            match bt_write_all(&w, &staging[..chunk]) {
                                Ok(()) => {
                                    staging.drain(..chunk);
                                }
                                Err(err) if bt_link_down(&err) => {
                                    log::debug!("{}: bt link down", pcm.path());
                                    return;
                                }
                                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => return,
                                Err(err) => {
                                    log::error!("{}: encoder write: {}", pcm.path(), err);
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => (),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
                    Err(err) => {
                        log::error!("{}: encoder read: {}", pcm.path(), err);
                        return;
                    }
                }
            }
        }
    }
}

/// Decoder loop: Bluetooth socket → client FIFO.
fn pcm_dec_worker(w: IoWorker, t: Arc<Transport>, pcm: Arc<TransportPcm>) {
    if w.thread.state_set(ThreadState::Running).is_err() {
        return;
    }
    let (mtu_read, _) = t.mtus();
    let mut buf = vec![0u8; mtu_read.max(64)];
    // On SCO some controllers never route audio to the host; bound the
    // first read so an otherwise idle encoder is not blocked forever.
    let mut first_read_timeout = match t.profile().is_sco() {
        true => Some(t.config.sco_first_read_timeout),
        false => None,
    };

    loop {
        let event = match w.wait(w.bt_fd.as_raw_fd(), first_read_timeout) {
            Ok(event) => event,
            Err(Error { kind: ErrorKind::Stopping, .. }) => return,
            Err(err) => {
                log::error!("{}: decoder wait: {}", pcm.path(), err);
                return;
            }
        };
        match event {
            IoEvent::Timeout => {
                // No inbound audio; from here on the host defines the read
                // cadence.
                log::debug!("{}: no initial SCO data, host-driven sizing", pcm.path());
                first_read_timeout = None;
            }
            IoEvent::Signal(Signal::PcmSync) => w.thread.drain_complete(),
            IoEvent::Signal(_) => (),
            IoEvent::Ready => {
                first_read_timeout = None;
                match sock::read(w.bt_fd.as_raw_fd(), &mut buf) {
                    Ok(0) => {
                        log::debug!("{}: bt endpoint closed", pcm.path());
                        return;
                    }
                    Ok(n) => {
                        if pcm.is_active() && pcm.fd() >= 0 {
                            match pcm.write(&buf[..n]) {
                                Ok(_) => (),
                                // A stalled client loses audio instead of
                                // stalling the link.
                                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => (),
                                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => pcm.release(),
                                Err(err) => log::warn!("{}: decoder write: {}", pcm.path(), err),
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => (),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
                    Err(err) if bt_link_down(&err) => {
                        log::debug!("{}: bt link down", pcm.path());
                        return;
                    }
                    Err(err) => {
                        log::error!("{}: decoder read: {}", pcm.path(), err);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_configuration_parsing() {
        // 44100 Hz stereo.
        assert_eq!(sbc_config_params(&[0x22, 0x15, 2, 53]), Some((44100, 2)));
        // 16000 Hz mono.
        assert_eq!(sbc_config_params(&[0x88, 0x15, 2, 53]), Some((16000, 1)));
        assert_eq!(sbc_config_params(&[]), None);
        assert_eq!(sbc_config_params(&[0x00]), None);
    }

    #[test]
    fn codec_registry_lookup() {
        assert_eq!(a2dp_codec_info(CodecId::Sbc).unwrap().media_codec, 0x00);
        assert!(a2dp_codec_info(CodecId::FastStream).unwrap().back_channel);
        assert!(a2dp_codec_info(CodecId::Cvsd).is_none());
        let aptx = a2dp_codec_from_media(0xff, Some((0x004f, 0x0001))).unwrap();
        assert_eq!(aptx.id, CodecId::AptX);
        assert_eq!(a2dp_codec_from_media(0x00, None).unwrap().id, CodecId::Sbc);
    }
}
