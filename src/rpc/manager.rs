//! The `org.bluealsa.Manager1` D-Bus object.

use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::sync::{Arc, Weak};

use crate::{
    method_call,
    rpc::MANAGER_INTERFACE,
    transport::{CodecId, Profile},
    SessionInner,
};

/// The service manager object published at `/org/bluealsa`.
pub(crate) struct ManagerObject {
    pub inner: Weak<SessionInner>,
}

impl ManagerObject {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Version", _obj => {
                Some(env!("CARGO_PKG_VERSION").to_string())
            });
            cr_property!(ib, "Adapters", obj => {
                obj.inner.upgrade().map(|inner| {
                    let mut names: Vec<String> =
                        inner.adapters().iter().map(|a| a.name().to_string()).collect();
                    names.sort();
                    names
                })
            });
            cr_property!(ib, "Profiles", _obj => {
                Some(vec![
                    Profile::A2dpSource.to_string(),
                    Profile::A2dpSink.to_string(),
                    Profile::HfpHf.to_string(),
                    Profile::HfpAg.to_string(),
                    Profile::HspHs.to_string(),
                    Profile::HspAg.to_string(),
                ])
            });
            cr_property!(ib, "Codecs", _obj => {
                Some(vec![
                    CodecId::Sbc.to_string(),
                    CodecId::Aac.to_string(),
                    CodecId::AptX.to_string(),
                    CodecId::AptXHd.to_string(),
                    CodecId::FastStream.to_string(),
                    CodecId::Ldac.to_string(),
                    CodecId::Cvsd.to_string(),
                    CodecId::Msbc.to_string(),
                    CodecId::Lc3Swb.to_string(),
                ])
            });
            ib.method_with_cr_async("GetPCMs", (), ("pcms",), |ctx, cr, ()| {
                method_call(ctx, cr, |obj: Arc<Self>| async move {
                    let mut pcms: Vec<dbus::Path<'static>> = Vec::new();
                    if let Some(inner) = obj.inner.upgrade() {
                        for adapter in inner.adapters() {
                            for device in adapter.devices() {
                                for transport in device.transports() {
                                    for pcm in transport.exported_pcms() {
                                        if let Ok(path) = dbus::Path::new(pcm.path().to_string()) {
                                            pcms.push(path);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    pcms.sort();
                    Ok((pcms,))
                })
            });
        })
    }
}
