//! Platform radio access.
//!
//! [`RadioAdapter`] is the seam between the connection manager and the
//! local Bluetooth controller. [`BluerAdapter`] implements it on top of
//! BlueZ and owns the adapter-state and discovery event channels.

use std::{collections::HashMap, future::Future, io, sync::Arc, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Session,
   rfcomm::{Profile, ProfileHandle, ReqError, Role, Stream},
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
   select,
   sync::oneshot,
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{RfcommTransport, Transport},
   config::Config,
   error::{BtError, Result},
   event::{AdapterState, DiscoveredDevice, DiscoveryEvent, EventChannel},
};

/// Serial Port Profile service class
const SERIAL_PORT_PROFILE: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// A device bonded with the local adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
   pub name: Option<String>,
   pub address: String,
   pub serial_port: bool,
}

/// Local radio controller.
///
/// All methods except [`RadioAdapter::is_available`] may fail with
/// [`BtError::Unavailable`] when no radio is present.
pub trait RadioAdapter: Send + Sync + 'static {
   type Transport: Transport;

   fn is_available(&self) -> bool;

   fn is_enabled(&self) -> impl Future<Output = Result<bool>> + Send;

   fn is_discovering(&self) -> impl Future<Output = Result<bool>> + Send;

   fn start_discovery(&self) -> impl Future<Output = Result<()>> + Send;

   fn cancel_discovery(&self) -> impl Future<Output = Result<()>> + Send;

   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<DeviceInfo>>> + Send;

   /// Opens a byte stream to `address`.
   fn open_transport(
      &self,
      address: Address,
   ) -> impl Future<Output = io::Result<Self::Transport>> + Send;

   /// Adapter power / discoverability transitions.
   fn state_events(&self) -> &EventChannel<AdapterState>;

   /// Devices found during discovery, followed by a finished signal.
   fn discovery_events(&self) -> &EventChannel<DiscoveryEvent>;
}

struct Channels {
   state: EventChannel<AdapterState>,
   discovery: EventChannel<DiscoveryEvent>,
}

/// Connects in flight through the serial port profile, by remote address.
type ProfileWaiters = Arc<Mutex<HashMap<Address, oneshot::Sender<io::Result<Stream>>>>>;

/// Drops the waiter for `address` if the connect is abandoned.
struct PendingProfile<'a> {
   waiters: &'a Mutex<HashMap<Address, oneshot::Sender<io::Result<Stream>>>>,
   address: Address,
}

impl Drop for PendingProfile<'_> {
   fn drop(&mut self) {
      self.waiters.lock().remove(&self.address);
   }
}

fn serial_port_profile() -> Profile {
   Profile {
      uuid: SERIAL_PORT_PROFILE,
      name: Some("btseriald".into()),
      role: Some(Role::Client),
      require_authentication: Some(false),
      require_authorization: Some(false),
      auto_connect: Some(false),
      ..Default::default()
   }
}

/// BlueZ-backed radio adapter.
pub struct BluerAdapter {
   adapter: Option<Adapter>,
   channels: Arc<Channels>,
   discovery: Mutex<Option<JoinHandle<()>>>,
   monitor: Option<JoinHandle<()>>,
   /// Hands streams from BlueZ to [`ProfileWaiters`]. `None` when the
   /// profile is not registered.
   profile_router: Option<JoinHandle<()>>,
   profile_waiters: ProfileWaiters,
   rfcomm_channel: Option<u8>,
   discovery_timeout: Duration,
}

impl BluerAdapter {
   /// Opens the default adapter. A missing adapter is not an error; the
   /// returned instance then reports itself unavailable.
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match session.default_adapter().await {
         Ok(adapter) => {
            info!("Using adapter {}", adapter.name());
            Some(adapter)
         },
         Err(e) => {
            warn!("No Bluetooth adapter available: {e}");
            None
         },
      };

      let channels = Arc::new(Channels {
         state: EventChannel::new("adapter-state"),
         discovery: EventChannel::new("discovery"),
      });
      let monitor = adapter
         .clone()
         .map(|adapter| Self::start_state_monitor(adapter, channels.clone()));

      let profile_waiters = ProfileWaiters::default();
      let profile_router = match (&adapter, config.rfcomm_channel) {
         (Some(_), None) => match session.register_profile(serial_port_profile()).await {
            Ok(handle) => {
               debug!("Registered serial port profile");
               Some(Self::start_profile_router(handle, profile_waiters.clone()))
            },
            Err(e) => {
               warn!("Failed to register serial port profile: {e}");
               None
            },
         },
         (Some(_), Some(channel)) => {
            info!("Using fixed RFCOMM channel {channel}");
            None
         },
         (None, _) => None,
      };

      Ok(Self {
         adapter,
         channels,
         discovery: Mutex::new(None),
         monitor,
         profile_router,
         profile_waiters,
         rfcomm_channel: config.rfcomm_channel,
         discovery_timeout: config.discovery_timeout(),
      })
   }

   fn adapter(&self) -> Result<&Adapter> {
      self.adapter.as_ref().ok_or(BtError::Unavailable)
   }

   fn start_state_monitor(adapter: Adapter, channels: Arc<Channels>) -> JoinHandle<()> {
      tokio::spawn(async move {
         let name = adapter.name().to_owned();
         let Ok(events) = adapter.events().await else {
            warn!("Failed to get adapter events for {name}");
            return;
         };
         tokio::pin!(events);

         let mut powered = adapter.is_powered().await.unwrap_or(false);
         while let Some(event) = events.next().await {
            let AdapterEvent::PropertyChanged(prop) = event else {
               continue;
            };
            let state = match prop {
               AdapterProperty::Powered(on) => {
                  powered = on;
                  if on { AdapterState::On } else { AdapterState::Off }
               },
               AdapterProperty::Discoverable(true) if powered => AdapterState::Discoverable,
               AdapterProperty::Discoverable(false) if powered => AdapterState::On,
               _ => continue,
            };
            debug!("Adapter {name} is now {state}");
            channels.state.emit(state);
         }

         warn!("Adapter {name} event stream ended");
      })
   }

   /// Accepts the streams BlueZ opens for our `connect_profile` calls and
   /// rejects any other.
   fn start_profile_router(handle: ProfileHandle, waiters: ProfileWaiters) -> JoinHandle<()> {
      tokio::spawn(async move {
         tokio::pin!(handle);
         while let Some(req) = handle.next().await {
            let device = req.device();
            let waiter = waiters.lock().remove(&device);
            let Some(waiter) = waiter else {
               debug!("Rejecting unrequested serial port connection from {device}");
               req.reject(ReqError::Rejected);
               continue;
            };
            let _ = waiter.send(req.accept().map_err(io::Error::from));
         }
         warn!("Serial port profile unregistered");
      })
   }

   /// Opens a stream to the serial port service of `address`. BlueZ looks
   /// the service channel up and hands the connected socket to the router.
   async fn connect_profile(&self, address: Address) -> io::Result<Stream> {
      if self.profile_router.is_none() {
         return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial port profile is not registered",
         ));
      }
      let device = self
         .adapter()
         .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))?
         .device(address)?;

      let (tx, rx) = oneshot::channel();
      self.profile_waiters.lock().insert(address, tx);
      let _pending = PendingProfile {
         waiters: &self.profile_waiters,
         address,
      };

      debug!("Connecting to the serial port profile of {address}");
      device.connect_profile(&SERIAL_PORT_PROFILE).await?;
      rx.await.map_err(|_| {
         io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "serial port profile connected without handing over a stream",
         )
      })?
   }

   async fn run_discovery(adapter: Adapter, channels: Arc<Channels>, timeout: Duration) {
      let events = match adapter.discover_devices().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Failed to start discovery: {e}");
            channels.discovery.emit(DiscoveryEvent::Finished);
            return;
         },
      };

      let deadline = time::sleep(timeout);
      tokio::pin!(events, deadline);
      loop {
         select! {
            () = &mut deadline => {
               debug!("Discovery timed out");
               break;
            }
            event = events.next() => {
               match event {
                  Some(AdapterEvent::DeviceAdded(addr)) => {
                     if let Some(device) = describe_discovered(&adapter, addr).await {
                        channels.discovery.emit(DiscoveryEvent::Found(device));
                     }
                  },
                  Some(_) => {},
                  None => break,
               }
            }
         }
      }

      channels.discovery.emit(DiscoveryEvent::Finished);
   }
}

async fn describe_discovered(adapter: &Adapter, addr: Address) -> Option<DiscoveredDevice> {
   let device = adapter.device(addr).ok()?;
   Some(DiscoveredDevice {
      name: device.name().await.ok().flatten(),
      address: addr.to_string(),
      rssi: device.rssi().await.ok().flatten(),
   })
}

impl RadioAdapter for BluerAdapter {
   type Transport = RfcommTransport;

   fn is_available(&self) -> bool {
      self.adapter.is_some()
   }

   async fn is_enabled(&self) -> Result<bool> {
      Ok(self.adapter()?.is_powered().await?)
   }

   async fn is_discovering(&self) -> Result<bool> {
      Ok(self.adapter()?.is_discovering().await?)
   }

   async fn start_discovery(&self) -> Result<()> {
      let adapter = self.adapter()?.clone();
      let handle = tokio::spawn(Self::run_discovery(
         adapter,
         self.channels.clone(),
         self.discovery_timeout,
      ));

      let previous = self.discovery.lock().replace(handle);
      if let Some(previous) = previous {
         debug!("Restarting discovery");
         previous.abort();
      }
      Ok(())
   }

   async fn cancel_discovery(&self) -> Result<()> {
      self.adapter()?;
      let handle = self.discovery.lock().take();
      if let Some(handle) = handle
         && !handle.is_finished()
      {
         handle.abort();
         self.channels.discovery.emit(DiscoveryEvent::Finished);
      }
      Ok(())
   }

   async fn bonded_devices(&self) -> Result<Vec<DeviceInfo>> {
      let adapter = self.adapter()?;
      let mut bonded = Vec::new();
      for addr in adapter.device_addresses().await? {
         let Ok(device) = adapter.device(addr) else {
            continue;
         };
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         let serial_port = device
            .uuids()
            .await
            .ok()
            .flatten()
            .is_some_and(|uuids| uuids.contains(&SERIAL_PORT_PROFILE));
         bonded.push(DeviceInfo {
            name: device.name().await.ok().flatten(),
            address: addr.to_string(),
            serial_port,
         });
      }
      Ok(bonded)
   }

   async fn open_transport(&self, address: Address) -> io::Result<RfcommTransport> {
      if let Some(channel) = self.rfcomm_channel {
         return RfcommTransport::connect(address, channel).await;
      }
      let stream = self.connect_profile(address).await?;
      Ok(RfcommTransport::from_stream(address, stream))
   }

   fn state_events(&self) -> &EventChannel<AdapterState> {
      &self.channels.state
   }

   fn discovery_events(&self) -> &EventChannel<DiscoveryEvent> {
      &self.channels.discovery
   }
}

impl Drop for BluerAdapter {
   fn drop(&mut self) {
      if let Some(handle) = self.monitor.take() {
         handle.abort();
      }
      if let Some(handle) = self.profile_router.take() {
         handle.abort();
      }
      if let Some(handle) = self.discovery.get_mut().take() {
         handle.abort();
      }
   }
}
