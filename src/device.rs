//! Remote Bluetooth devices.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

use crate::{
    transport::Transport,
    Adapter, Address, BaEvent, Error, ErrorKind, Result, RfcommProperty,
};

/// Battery snapshot of a remote device.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Battery {
    /// Whether the remote reports battery at all.
    pub available: bool,
    /// Charge level in percent.
    pub level: u8,
}

/// Apple accessory identity reported through XAPL/IPHONEACCEV.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AppleAccessory {
    /// Accessory vendor id.
    pub vendor_id: u16,
    /// Accessory product id.
    pub product_id: u16,
    /// Accessory firmware version.
    pub version: String,
    /// Supported feature bits.
    pub features: u32,
    /// Whether the accessory reports itself as docked.
    pub docked: bool,
}

/// One remote Bluetooth address known on an adapter.
pub struct Device {
    adapter: Arc<Adapter>,
    address: Address,
    path: String,
    battery: Mutex<Battery>,
    xapl: Mutex<AppleAccessory>,
    transports: Mutex<HashMap<String, Arc<Transport>>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Device {{ address: {} }}", self.address)
    }
}

impl Device {
    pub(crate) fn new(adapter: Arc<Adapter>, address: Address) -> Arc<Self> {
        let path = format!("{}/dev_{}", adapter.path(), address.to_path_component());
        Arc::new(Self {
            adapter,
            address,
            path,
            battery: Mutex::new(Battery::default()),
            xapl: Mutex::new(AppleAccessory::default()),
            transports: Mutex::new(HashMap::new()),
        })
    }

    /// Owning adapter.
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Remote Bluetooth address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Stable presentation path derived from the address.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Battery snapshot.
    pub fn battery(&self) -> Battery {
        *self.battery.lock().unwrap()
    }

    /// Update the battery snapshot, notifying the front end.
    pub fn set_battery(&self, battery: Battery) {
        {
            let mut current = self.battery.lock().unwrap();
            if *current == battery {
                return;
            }
            *current = battery;
        }
        let level = if battery.available { battery.level.min(100) as i8 } else { -1 };
        let _ = self.adapter.events().send(BaEvent::RfcommPropertyChanged {
            path: format!("{}/rfcomm", self.path),
            property: RfcommProperty::Battery(level),
        });
    }

    /// Apple accessory identity.
    pub fn apple_accessory(&self) -> AppleAccessory {
        self.xapl.lock().unwrap().clone()
    }

    /// Update the Apple accessory identity reported by the RFCOMM worker.
    pub fn set_apple_accessory(&self, xapl: AppleAccessory) {
        *self.xapl.lock().unwrap() = xapl;
    }

    pub(crate) fn register_transport(&self, transport: &Arc<Transport>) -> Result<()> {
        let mut transports = self.transports.lock().unwrap();
        if transports.contains_key(transport.path()) {
            return Err(Error::with_message(ErrorKind::Busy, transport.path().to_string()));
        }
        transports.insert(transport.path().to_string(), transport.clone());
        Ok(())
    }

    pub(crate) fn unregister_transport(&self, path: &str) {
        self.transports.lock().unwrap().remove(path);
    }

    /// Transport registered under the given daemon object path.
    pub fn transport(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().get(path).cloned()
    }

    /// Snapshot of all transports of this device.
    ///
    /// The map mutex is not held while the caller works with the result.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.lock().unwrap().values().cloned().collect()
    }

    /// The SCO-capable transport of this device, if any.
    pub fn sco_transport(&self) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().values().find(|t| t.profile().is_sco()).cloned()
    }

    /// Whether any transport is registered.
    pub fn is_empty(&self) -> bool {
        self.transports.lock().unwrap().is_empty()
    }

    /// Destroy all transports and remove the device from its adapter.
    pub fn destroy(&self) {
        let transports: Vec<_> = {
            let mut map = self.transports.lock().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.destroy();
        }
        self.adapter.remove_device(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn device_path_derivation() {
        let adapter = Adapter::standalone(0, Config::default());
        let device = adapter.device_get_or_create("12:34:56:78:9A:BC".parse().unwrap());
        assert_eq!(device.path(), "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC");
        assert!(device.is_empty());
    }

    #[test]
    fn battery_snapshot() {
        let adapter = Adapter::standalone(0, Config::default());
        let device = adapter.device_get_or_create("12:34:56:78:9A:BC".parse().unwrap());
        assert!(!device.battery().available);
        device.set_battery(Battery { available: true, level: 42 });
        assert_eq!(device.battery().level, 42);
    }
}
