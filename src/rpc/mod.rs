//! The `org.bluealsa` D-Bus service objects.

use dbus::{
    arg::{PropMap, RefArg, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    Path,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{BaEvent, PcmProperty, RfcommProperty};

pub(crate) mod bluez;
pub(crate) mod manager;
pub(crate) mod pcm;
pub(crate) mod rfcomm;

pub(crate) const MANAGER_INTERFACE: &str = "org.bluealsa.Manager1";
pub(crate) const PCM_INTERFACE: &str = "org.bluealsa.PCM1";
pub(crate) const RFCOMM_INTERFACE: &str = "org.bluealsa.RFCOMM1";

/// Parent of a D-Bus style path; used to derive the device object path
/// from a transport object path.
pub(crate) fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn pcm_property_arg(property: &PcmProperty) -> (&'static str, Variant<Box<dyn RefArg>>) {
    match property {
        PcmProperty::Running(v) => ("Running", Variant(Box::new(*v))),
        PcmProperty::Codec(v) => ("Codec", Variant(Box::new(v.clone()))),
        PcmProperty::Format(v) => ("Format", Variant(Box::new(*v))),
        PcmProperty::Channels(v) => ("Channels", Variant(Box::new(*v))),
        PcmProperty::Rate(v) => ("Rate", Variant(Box::new(*v))),
        PcmProperty::Delay(v) => ("Delay", Variant(Box::new(*v))),
        PcmProperty::ClientDelay(v) => ("ClientDelay", Variant(Box::new(*v))),
        PcmProperty::SoftVolume(v) => ("SoftVolume", Variant(Box::new(*v))),
        PcmProperty::Volume(v) => ("Volume", Variant(Box::new(v.clone()))),
    }
}

/// Forward property changes from the core threads to the bus.
///
/// Emission happens strictly after the core released its internal locks;
/// the channel decouples the worker threads from D-Bus entirely.
pub(crate) async fn event_pump(connection: Arc<SyncConnection>, mut rx: UnboundedReceiver<BaEvent>) {
    while let Some(event) = rx.recv().await {
        let (path, interface, name, value) = match event {
            BaEvent::PcmPropertyChanged { path, property } => {
                let (name, value) = pcm_property_arg(&property);
                (path, PCM_INTERFACE, name, value)
            }
            BaEvent::RfcommPropertyChanged { path, property } => match property {
                RfcommProperty::Battery(v) => {
                    (path, RFCOMM_INTERFACE, "Battery", Variant(Box::new(v as i16) as Box<dyn RefArg>))
                }
            },
        };
        let path = match Path::new(path) {
            Ok(path) => path,
            Err(_) => continue,
        };
        let mut changed_properties = PropMap::new();
        changed_properties.insert(name.to_string(), value);
        let ppc = PropertiesPropertiesChanged {
            interface_name: interface.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        log::trace!("{}: {}.{} changed", path, interface, name);
        if connection.send(ppc.to_emit_message(&path)).is_err() {
            log::warn!("lost D-Bus connection, stopping property emission");
            break;
        }
    }
}

/// Translate a core error into a D-Bus error reply.
pub(crate) fn method_err(err: crate::Error) -> dbus::MethodErr {
    let name = match &err.kind {
        crate::ErrorKind::Busy => "Busy",
        crate::ErrorKind::NotSupported => "NotSupported",
        crate::ErrorKind::TimedOut => "TimedOut",
        crate::ErrorKind::NotFound => "NotFound",
        crate::ErrorKind::InvalidArguments => "InvalidArguments",
        _ => "Failed",
    };
    dbus::MethodErr::from((format!("{}{}", crate::ERR_PREFIX, name), &err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_path_derivation() {
        assert_eq!(parent_of("/org/bluez/hci0/dev_XX/fd0"), "/org/bluez/hci0/dev_XX");
        assert_eq!(parent_of("/org"), "/");
        assert_eq!(parent_of("plain"), "/");
    }
}
