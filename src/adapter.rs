//! Local Bluetooth adapters.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

use crate::{
    config::{Config, RuntimeState},
    device::Device,
    dispatch::ScoDispatcher,
    hci,
    transport::Transport,
    Address, EventSender, Result, SERVICE_PATH,
};

/// One local HCI controller.
///
/// Adapters are created on demand on the first use of an index and own
/// their devices and the SCO dispatcher. The configuration reference is
/// immutable; hot-pluggable state lives in the shared [RuntimeState].
pub struct Adapter {
    idx: u16,
    name: String,
    path: String,
    chip: Option<hci::HciVersion>,
    bus_usb: bool,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
    sco: Mutex<Option<ScoDispatcher>>,
    config: Arc<Config>,
    runtime: Arc<RuntimeState>,
    events: EventSender,
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ name: {} }}", self.name)
    }
}

impl Adapter {
    pub(crate) fn new(
        idx: u16, config: Arc<Config>, runtime: Arc<RuntimeState>, events: EventSender,
    ) -> Arc<Self> {
        // The chip snapshot is best effort; without HCI access (e.g. in
        // tests) the adapter simply carries no quirk information.
        let chip = hci::local_version(idx)
            .map_err(|err| log::debug!("hci{idx}: no chip version: {err}"))
            .ok();
        let bus_usb = hci::dev_info(idx).map(|info| info.type_ & 0x0f == crate::sys::HCI_BUS_USB).unwrap_or(false);
        let name = format!("hci{idx}");
        Arc::new(Self {
            path: format!("{SERVICE_PATH}/{name}"),
            idx,
            name,
            chip,
            bus_usb,
            devices: Mutex::new(HashMap::new()),
            sco: Mutex::new(None),
            config,
            runtime,
            events,
        })
    }

    /// Create a standalone adapter without a D-Bus session.
    ///
    /// Property notifications go nowhere; useful for tests and tools.
    pub fn standalone(idx: u16, config: Config) -> Arc<Self> {
        Self::new(idx, Arc::new(config), Arc::new(RuntimeState::default()), crate::null_events())
    }

    /// HCI index of the adapter.
    pub fn index(&self) -> u16 {
        self.idx
    }

    /// Adapter name, e.g. `hci0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Presentation path of the adapter.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Chip identity snapshot, if the controller was reachable.
    pub fn chip(&self) -> Option<&hci::HciVersion> {
        self.chip.as_ref()
    }

    /// Whether the controller is attached over USB.
    pub fn is_usb(&self) -> bool {
        self.bus_usb
    }

    /// Process configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Hot-pluggable runtime state.
    pub fn runtime(&self) -> Arc<RuntimeState> {
        self.runtime.clone()
    }

    pub(crate) fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Known device for the given address, if any.
    pub fn device(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// Device for the given address, created on first use.
    pub fn device_get_or_create(self: &Arc<Self>, address: Address) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        devices.entry(address).or_insert_with(|| Device::new(self.clone(), address)).clone()
    }

    pub(crate) fn remove_device(&self, address: Address) {
        self.devices.lock().unwrap().remove(&address);
    }

    /// Snapshot of all known devices.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// Whether no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().unwrap().is_empty()
    }

    /// Look up a transport by its daemon object path across all devices.
    pub fn transport(&self, path: &str) -> Option<Arc<Transport>> {
        let devices = self.devices();
        devices.iter().find_map(|d| d.transport(path))
    }

    /// Start the SCO dispatcher for this adapter. At most one exists.
    pub fn start_sco_dispatcher(self: &Arc<Self>) -> Result<()> {
        let mut sco = self.sco.lock().unwrap();
        if sco.is_none() {
            *sco = Some(ScoDispatcher::start(self)?);
        }
        Ok(())
    }

    /// Stop the SCO dispatcher, if one is running.
    pub fn stop_sco_dispatcher(&self) {
        self.sco.lock().unwrap().take();
    }

    /// Destroy all devices and cancel the SCO dispatcher.
    pub fn destroy(&self) {
        self.stop_sco_dispatcher();
        let devices: Vec<_> = {
            let mut map = self.devices.lock().unwrap();
            map.drain().map(|(_, d)| d).collect()
        };
        for device in devices {
            for transport in device.transports() {
                transport.destroy();
            }
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        // Destruction cancels the dispatcher; devices hold strong adapter
        // references, so reaching this point implies the device map was
        // already drained.
        self.sco.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_identity() {
        let adapter = Adapter::standalone(0, Config::default());
        assert_eq!(adapter.name(), "hci0");
        assert_eq!(adapter.path(), "/org/bluealsa/hci0");
        assert!(adapter.is_empty());
    }

    #[test]
    fn device_creation_is_idempotent() {
        let adapter = Adapter::standalone(0, Config::default());
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let a = adapter.device_get_or_create(addr);
        let b = adapter.device_get_or_create(addr);
        assert!(Arc::ptr_eq(&a, &b));
        adapter.remove_device(addr);
        assert!(adapter.device(addr).is_none());
    }
}
