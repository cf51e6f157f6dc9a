//! The `org.bluealsa.PCM1` D-Bus objects.

use dbus::{arg::PropMap, MethodErr};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{os::unix::io::IntoRawFd, str::FromStr, sync::Arc};

use crate::{
    method_call,
    pcm::TransportPcm,
    rpc::{method_err, parent_of, PCM_INTERFACE},
    thread::ThreadState,
    transport::{CodecId, Transport, TransportData},
};

/// One PCM endpoint exposed over D-Bus.
pub(crate) struct PcmObject {
    pub transport: Arc<Transport>,
    pub pcm: Arc<TransportPcm>,
}

impl PcmObject {
    pub(crate) fn new(transport: Arc<Transport>, pcm: Arc<TransportPcm>) -> Arc<Self> {
        Arc::new(Self { transport, pcm })
    }

    fn running(&self) -> bool {
        self.pcm.thread().map(|t| t.state() == ThreadState::Running).unwrap_or(false)
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(PCM_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Device", obj => {
                dbus::Path::new(parent_of(obj.transport.path())).ok()
            });
            cr_property!(ib, "Mode", obj => {
                Some(obj.pcm.mode().to_string())
            });
            cr_property!(ib, "Format", obj => {
                Some(obj.pcm.params().format.0)
            });
            cr_property!(ib, "Channels", obj => {
                Some(obj.pcm.params().channels)
            });
            cr_property!(ib, "Rate", obj => {
                Some(obj.pcm.params().rate)
            });
            cr_property!(ib, "Codec", obj => {
                Some(obj.transport.codec().to_string())
            });
            cr_property!(ib, "CodecConfiguration", obj => {
                match &obj.transport.data {
                    TransportData::A2dp(a2dp) => Some(a2dp.configuration().to_vec()),
                    _ => Some(Vec::new()),
                }
            });
            cr_property!(ib, "Delay", obj => {
                Some(obj.pcm.delay().clamp(0, u16::MAX as i32) as u16)
            });
            ib.property("ClientDelay")
                .get(|_ctx, obj| Ok(obj.pcm.client_delay()))
                .set(|ctx, obj, value| {
                    log::trace!("{}: {}.ClientDelay <- {}", ctx.path(), PCM_INTERFACE, value);
                    obj.pcm.set_client_delay(value);
                    Ok(None)
                });
            ib.property("SoftVolume")
                .get(|_ctx, obj| Ok(obj.pcm.soft_volume()))
                .set(|ctx, obj, value| {
                    log::trace!("{}: {}.SoftVolume <- {}", ctx.path(), PCM_INTERFACE, value);
                    obj.pcm.set_soft_volume(value);
                    Ok(None)
                });
            ib.property("Volume")
                .get(|_ctx, obj| {
                    let max = obj.pcm.wire_volume_max();
                    let channels = obj.pcm.params().channels.min(2) as usize;
                    let volume: Vec<u8> =
                        obj.pcm.volume().iter().take(channels).map(|v| v.to_wire(max)).collect();
                    Ok(volume)
                })
                .set(|ctx, obj, value: Vec<u8>| {
                    log::trace!("{}: {}.Volume <- {:?}", ctx.path(), PCM_INTERFACE, value);
                    let max = obj.pcm.wire_volume_max();
                    let mut volume = obj.pcm.volume();
                    for (i, byte) in value.iter().take(2).enumerate() {
                        let hard = volume[i].hard_mute;
                        volume[i] = crate::volume::ChannelVolume::from_wire(*byte, max);
                        volume[i].set_mute(volume[i].soft_mute, hard);
                    }
                    obj.pcm.volume_update(volume);
                    Ok(None)
                });
            cr_property!(ib, "Running", obj => {
                Some(obj.running())
            });

            ib.method_with_cr_async(
                "Open",
                (),
                ("pcm", "control"),
                |ctx, cr, ()| {
                    method_call(ctx, cr, |obj: Arc<Self>| async move {
                        let transport = obj.transport.clone();
                        let pcm = obj.pcm.clone();
                        let fds = tokio::task::spawn_blocking(move || -> crate::Result<_> {
                            transport.acquire()?;
                            transport.start()?;
                            if transport.config.multi_client
                                && pcm.mode() == crate::pcm::PcmMode::Sink
                                && !pcm.has_multi()
                            {
                                crate::multi::PcmMulti::start(&pcm)?;
                            }
                            pcm.open()
                        })
                        .await
                        .map_err(|_| MethodErr::failed("PCM open worker failed"))?
                        .map_err(method_err)?;
                        let (pcm_fd, control_fd) = fds;
                        Ok((
                            unsafe { dbus::arg::OwnedFd::new(pcm_fd.into_raw_fd()) },
                            unsafe { dbus::arg::OwnedFd::new(control_fd.into_raw_fd()) },
                        ))
                    })
                },
            );
            ib.method_with_cr_async(
                "SelectCodec",
                ("codec", "props"),
                (),
                |ctx, cr, (codec, _props): (String, PropMap)| {
                    method_call(ctx, cr, |obj: Arc<Self>| async move {
                        let codec = CodecId::from_str(&codec)
                            .map_err(|_| MethodErr::invalid_arg("codec"))?;
                        let transport = obj.transport.clone();
                        tokio::task::spawn_blocking(move || transport.select_codec(codec))
                            .await
                            .map_err(|_| MethodErr::failed("codec selection worker failed"))?
                            .map_err(method_err)?;
                        Ok(())
                    })
                },
            );
            ib.method_with_cr_async("GetCodecs", (), ("codecs",), |ctx, cr, ()| {
                method_call(ctx, cr, |obj: Arc<Self>| async move {
                    let codecs: Vec<String> =
                        obj.transport.codec_list().iter().map(|c| c.to_string()).collect();
                    Ok((codecs,))
                })
            });
        })
    }
}
