//! BlueALSA D-Bus session.

use dbus::{
    arg::prop_cast,
    message::{MatchRule, SignalArgs},
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    strings::BusName,
    Message, Path,
};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::{channel::mpsc, StreamExt};
use lazy_static::lazy_static;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    str::FromStr,
    sync::{Arc, Mutex, OnceLock, Weak},
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{
    config::{Config, RuntimeState},
    dispatch,
    rpc::{
        self,
        bluez::MEDIA_TRANSPORT_INTERFACE,
        manager::ManagerObject,
        pcm::PcmObject,
        rfcomm::RfcommObject,
    },
    transport::{
        A2dpData, A2dpState, CodecId, Profile, RfcommLink, ScoData, Transport, TransportCreate,
        TransportData,
    },
    Adapter, Address, Error, ErrorKind, EventSender, Result, SERVICE_NAME, SERVICE_PATH,
};

/// Shared state of one BlueALSA session.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: futures::lock::Mutex<Crossroads>,
    pub manager_token: IfaceToken<Arc<ManagerObject>>,
    pub pcm_token: IfaceToken<Arc<PcmObject>>,
    pub rfcomm_token: IfaceToken<Arc<RfcommObject>>,
    pub config: Arc<Config>,
    pub runtime: Arc<RuntimeState>,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
    pub events_tx: EventSender,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl SessionInner {
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

/// BlueALSA session.
///
/// Owns the connection to the system bus, publishes the `org.bluealsa`
/// service and keeps the adapter registry. Transports are announced into
/// the session by the BlueZ endpoint and profile glue.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Connect to the system bus and publish the `org.bluealsa` service.
    pub async fn new(config: Config) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        connection.request_name(SERVICE_NAME, false, true, true).await?;

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let manager_token = ManagerObject::register_interface(&mut crossroads);
        let pcm_token = PcmObject::register_interface(&mut crossroads);
        let rfcomm_token = RfcommObject::register_interface(&mut crossroads);

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(rpc::event_pump(connection.clone(), events_rx));

        let inner = Arc::new(SessionInner {
            connection: connection.clone(),
            crossroads: futures::lock::Mutex::new(crossroads),
            manager_token,
            pcm_token,
            rfcomm_token,
            config: Arc::new(config),
            runtime: Arc::new(RuntimeState::default()),
            adapters: Mutex::new(HashMap::new()),
            events_tx,
            dbus_task,
        });

        {
            let mut cr = inner.crossroads.lock().await;
            let manager = Arc::new(ManagerObject { inner: Arc::downgrade(&inner) });
            let manager_token = inner.manager_token;
            cr.insert(Path::from(SERVICE_PATH), &[manager_token], manager);
        }

        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner = match mc_inner.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*mc_inner.connection);
            }
        });

        Self::watch_bluez(inner.clone()).await?;

        Ok(Self { inner })
    }

    /// The adapter with the given HCI index, created on first use.
    pub fn adapter(&self, idx: u16) -> Arc<Adapter> {
        let mut adapters = self.inner.adapters.lock().unwrap();
        adapters
            .entry(idx)
            .or_insert_with(|| {
                Adapter::new(
                    idx,
                    self.inner.config.clone(),
                    self.inner.runtime.clone(),
                    self.inner.events_tx.clone(),
                )
            })
            .clone()
    }

    /// Called by the endpoint glue when BlueZ announces an A2DP transport.
    ///
    /// Creates the transport with daemon-backed acquire/release callbacks
    /// and publishes its PCM objects.
    #[allow(clippy::too_many_arguments)]
    pub async fn announce_a2dp_transport(
        &self, adapter_idx: u16, address: Address, owner: String, path: String, endpoint: String,
        profile: Profile, codec: CodecId, configuration: Vec<u8>, state: A2dpState,
    ) -> Result<Arc<Transport>> {
        if !profile.is_a2dp() {
            return Err(Error::new(ErrorKind::InvalidArguments));
        }
        let info = crate::codec::a2dp_codec_info(codec)
            .ok_or_else(|| Error::with_message(ErrorKind::NotSupported, codec.to_string()))?;
        let adapter = self.adapter(adapter_idx);
        let device = adapter.device_get_or_create(address);

        let connection = self.inner.connection.clone();
        let transport = spawn_blocking({
            let path = path.clone();
            move || {
                Transport::new(TransportCreate {
                    device,
                    owner,
                    path: path.clone(),
                    profile,
                    data: TransportData::A2dp(A2dpData::new(endpoint, info, configuration, state)),
                    acquire: rpc::bluez::acquire_fn(connection.clone(), path.clone()),
                    release: rpc::bluez::release_fn(connection.clone(), path.clone()),
                    remote_volume: Some(rpc::bluez::volume_fn(connection, path)),
                })
            }
        })
        .await??;

        self.export_transport(&transport).await;
        Ok(transport)
    }

    /// Called by the profile glue when an HFP/HSP service connection is up.
    ///
    /// Gateway roles initiate the SCO link themselves through an outgoing
    /// connect; for both roles the adapter's SCO dispatcher picks up
    /// kernel-accepted incoming links.
    pub async fn announce_sco_transport(
        &self, adapter_idx: u16, address: Address, owner: String, path: String, profile: Profile,
        rfcomm: Option<RfcommLink>,
    ) -> Result<Arc<Transport>> {
        if !profile.is_sco() {
            return Err(Error::new(ErrorKind::InvalidArguments));
        }
        let adapter = self.adapter(adapter_idx);
        if let Err(err) = adapter.start_sco_dispatcher() {
            log::warn!("{}: SCO dispatcher: {}", adapter.name(), err);
        }
        let device = adapter.device_get_or_create(address);

        // The link codec is only known at connect time, so the acquire
        // callback reads it back from the transport it serves.
        let transport_slot: Arc<OnceLock<Weak<Transport>>> = Arc::new(OnceLock::new());
        let acquire: crate::transport::AcquireFn = {
            let adapter = adapter.clone();
            let slot = transport_slot.clone();
            Box::new(move |_kind| {
                let codec = slot
                    .get()
                    .and_then(|w| w.upgrade())
                    .map(|t| t.codec())
                    .unwrap_or(CodecId::Cvsd);
                dispatch::sco_connect(&adapter, address, codec)
            })
        };
        let release: crate::transport::ReleaseFn = Box::new(|| Ok(()));

        let transport = spawn_blocking(move || {
            Transport::new(TransportCreate {
                device,
                owner,
                path,
                profile,
                data: TransportData::Sco(ScoData::new(rfcomm)),
                acquire,
                release,
                remote_volume: None,
            })
        })
        .await??;
        let _ = transport_slot.set(Arc::downgrade(&transport));

        self.export_transport(&transport).await;
        Ok(transport)
    }

    /// Publish the D-Bus objects of a transport.
    async fn export_transport(&self, transport: &Arc<Transport>) {
        let mut cr = self.inner.crossroads.lock().await;
        let pcm_token = self.inner.pcm_token;
        let rfcomm_token = self.inner.rfcomm_token;
        for pcm in transport.exported_pcms() {
            if let Ok(path) = Path::new(pcm.path().to_string()) {
                log::debug!("exporting PCM object {}", pcm.path());
                cr.insert(path, &[pcm_token], PcmObject::new(transport.clone(), pcm));
            }
        }
        if transport.profile().is_sco() {
            let device = transport.device().clone();
            if let Ok(path) = Path::new(format!("{}/rfcomm", device.path())) {
                cr.insert(path, &[rfcomm_token], RfcommObject::new(device, transport.clone()));
            }
        }
    }

    /// Withdraw the D-Bus objects of a transport and tear it down.
    pub async fn remove_transport(&self, transport: &Arc<Transport>) -> Result<()> {
        {
            let mut cr = self.inner.crossroads.lock().await;
            for pcm in transport.exported_pcms() {
                if let Ok(path) = Path::new(pcm.path().to_string()) {
                    let _: Option<Arc<PcmObject>> = cr.remove(&path);
                }
            }
            if transport.profile().is_sco() {
                if let Ok(path) = Path::new(format!("{}/rfcomm", transport.device().path())) {
                    let _: Option<Arc<RfcommObject>> = cr.remove(&path);
                }
            }
        }
        let transport = transport.clone();
        spawn_blocking(move || transport.destroy()).await?;
        Ok(())
    }

    /// Track `MediaTransport1` property changes announced by BlueZ: the
    /// transport state machine, the daemon delay estimate and the remote
    /// (AVRCP) volume.
    async fn watch_bluez(inner: Arc<SessionInner>) -> Result<()> {
        lazy_static! {
            static ref BLUEZ_BUS: BusName<'static> = BusName::new(crate::BLUEZ_SERVICE).unwrap();
            static ref BLUEZ_REF: Option<&'static BusName<'static>> = Some(&BLUEZ_BUS);
        }
        let rule = PropertiesPropertiesChanged::match_rule(*BLUEZ_REF, None);

        let (msg_tx, mut msg_rx) = mpsc::unbounded();
        let msg_match = inner.connection.add_match(rule).await?.msg_cb(move |msg: Message| {
            let _ = msg_tx.unbounded_send(msg);
            true
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let _msg_match = msg_match;
            while let Some(msg) = msg_rx.next().await {
                let Some(inner) = weak.upgrade() else { break };
                handle_bluez_signal(&inner, &msg);
            }
        });
        Ok(())
    }
}

fn handle_bluez_signal(inner: &SessionInner, msg: &Message) {
    let (Some(path), Some(ppc)) = (msg.path(), PropertiesPropertiesChanged::from_message(msg)) else {
        return;
    };
    if ppc.interface_name != MEDIA_TRANSPORT_INTERFACE {
        return;
    }
    let path = path.to_string();
    let Some(transport) = inner.adapters().iter().find_map(|a| a.transport(&path)) else {
        return;
    };
    if !transport.profile().is_a2dp() {
        return;
    }

    if let Some(state) = prop_cast::<String>(&ppc.changed_properties, "State") {
        match A2dpState::from_str(state) {
            Ok(state) => transport.a2dp_state_update(state),
            Err(_) => log::warn!("{}: unknown transport state {}", path, state),
        }
    }
    if let Some(delay) = prop_cast::<u16>(&ppc.changed_properties, "Delay") {
        if let TransportData::A2dp(a2dp) = &transport.data {
            a2dp.set_delay_reported(*delay);
        }
        transport.pcm().set_delay(*delay);
    }
    if let Some(volume) = prop_cast::<u16>(&ppc.changed_properties, "Volume") {
        let level = crate::volume::range_to_level(*volume as i32, crate::volume::RANGE_MAX_A2DP);
        let pcm = transport.pcm();
        let mut v = pcm.volume();
        v[0].set_level(level);
        v[1].set_level(level);
        // The change originated at the remote; do not echo it back.
        pcm.volume_update_local(v);
    }
}
