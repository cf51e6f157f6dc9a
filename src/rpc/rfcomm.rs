//! The `org.bluealsa.RFCOMM1` D-Bus objects.

use dbus::MethodErr;
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::sync::Arc;

use crate::{
    device::Device,
    method_call,
    rpc::RFCOMM_INTERFACE,
    transport::{Profile, Transport},
};

/// RFCOMM control object of one SCO-capable device.
pub(crate) struct RfcommObject {
    pub device: Arc<Device>,
    pub transport: Arc<Transport>,
}

fn transport_label(profile: Profile) -> &'static str {
    match profile {
        Profile::HfpHf => "HFP-HF",
        Profile::HfpAg => "HFP-AG",
        Profile::HspHs => "HSP-HS",
        Profile::HspAg => "HSP-AG",
        _ => "NONE",
    }
}

impl RfcommObject {
    pub(crate) fn new(device: Arc<Device>, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self { device, transport })
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(RFCOMM_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Transport", obj => {
                Some(transport_label(obj.transport.profile()).to_string())
            });
            cr_property!(ib, "Features", obj => {
                let xapl = obj.device.apple_accessory();
                let mut features = Vec::new();
                if xapl.features & 1 << 1 != 0 {
                    features.push("battery".to_string());
                }
                if xapl.features & 1 << 2 != 0 {
                    features.push("docked".to_string());
                }
                Some(features)
            });
            cr_property!(ib, "Battery", obj => {
                let battery = obj.device.battery();
                Some(if battery.available { battery.level.min(100) as i16 } else { -1 })
            });
            ib.method_with_cr_async("Open", (), ("fd",), |ctx, cr, ()| {
                method_call(ctx, cr, |_obj: Arc<Self>| async move {
                    // The AT command stream belongs to the external RFCOMM
                    // handler; the core has no socket to hand out here.
                    Err::<(dbus::arg::OwnedFd,), _>(MethodErr::from((
                        format!("{}NotSupported", crate::ERR_PREFIX),
                        "no external AT handler attached",
                    )))
                })
            });
        })
    }
}
