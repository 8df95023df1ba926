use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
   bluetooth::adapter::BluerAdapter,
   connection::{ConnectionId, ConnectionManager},
   control,
   error::BtError,
   event::{EventSender, ServiceEvent},
};

pub type Manager = ConnectionManager<BluerAdapter>;

pub struct BtSerialService {
   manager: Arc<Manager>,
   events: EventSender,
}

impl BtSerialService {
   pub const fn new(manager: Arc<Manager>, events: EventSender) -> Self {
      Self { manager, events }
   }

   /// Pumps a subscription into the event bus until the channel closes.
   fn forward<E, F>(&self, name: String, mut rx: mpsc::Receiver<E>, wrap: F)
   where
      E: Send + 'static,
      F: Fn(E) -> ServiceEvent + Send + 'static,
   {
      let events = self.events.clone();
      tokio::spawn(async move {
         while let Some(event) = rx.recv().await {
            events.emit(wrap(event));
         }
         debug!("{name}: subscription closed");
      });
   }
}

/// Maps a service error onto the closest standard D-Bus error, keeping the
/// stable code in front of the message.
pub fn to_fdo(e: BtError) -> fdo::Error {
   let message = format!("{}: {e}", e.code());
   match e {
      BtError::InvalidArgument(_) => fdo::Error::InvalidArgs(message),
      BtError::PermissionDenied(_) => fdo::Error::AccessDenied(message),
      BtError::Unavailable => fdo::Error::NotSupported(message),
      _ => fdo::Error::Failed(message),
   }
}

#[interface(name = "org.btserial.Manager")]
impl BtSerialService {
   async fn is_available(&self) -> bool {
      self.manager.is_available()
   }

   async fn is_enabled(&self) -> fdo::Result<bool> {
      self.manager.is_enabled().await.map_err(to_fdo)
   }

   async fn is_discovering(&self) -> fdo::Result<bool> {
      self.manager.is_discovering().await.map_err(to_fdo)
   }

   async fn start_discovery(&self) -> fdo::Result<()> {
      self.manager.start_discovery().await.map_err(to_fdo)
   }

   async fn cancel_discovery(&self) -> fdo::Result<()> {
      self.manager.cancel_discovery().await.map_err(to_fdo)
   }

   async fn get_bonded_devices(&self) -> fdo::Result<String> {
      let devices = self.manager.bonded_devices().await.map_err(to_fdo)?;
      serde_json::to_string(&devices).map_err(|e| to_fdo(e.into()))
   }

   async fn connect(&self, address: String) -> fdo::Result<String> {
      let id = self.manager.connect(&address).await.map_err(to_fdo)?;
      Ok(id.into())
   }

   async fn is_connected(&self, id: String) -> bool {
      self.manager.is_connected(&id)
   }

   /// Ids of the live connections, sorted.
   async fn get_connections(&self) -> Vec<String> {
      self
         .manager
         .connection_ids()
         .into_iter()
         .map(String::from)
         .collect()
   }

   async fn disconnect(&self, id: String) -> fdo::Result<()> {
      self.manager.disconnect(&id).await.map_err(to_fdo)
   }

   async fn write(&self, id: String, data: Vec<u8>) -> fdo::Result<()> {
      self.manager.write(&id, &data).await.map_err(to_fdo)
   }

   /// Streams the connection's inbound data as `DataReceived` signals.
   async fn subscribe_read(&self, id: String) -> fdo::Result<()> {
      let rx = self.manager.open_read_stream(&id).map_err(to_fdo)?;
      let id = ConnectionId::from(id);
      self.forward(format!("read {id}"), rx, move |event| {
         ServiceEvent::Read(id.clone(), event)
      });
      Ok(())
   }

   /// Stops streaming and closes the connection.
   async fn unsubscribe_read(&self, id: String) -> fdo::Result<()> {
      info!("{id}: read stream unsubscribed");
      self.manager.disconnect(&id).await.map_err(to_fdo)
   }

   /// Stops streaming but keeps the connection open.
   async fn detach_read(&self, id: String) -> fdo::Result<()> {
      self.manager.detach_listener(&id).await.map_err(to_fdo)
   }

   async fn subscribe_adapter_state(&self) -> fdo::Result<()> {
      let rx = self.manager.subscribe_adapter_state().map_err(to_fdo)?;
      self.forward("adapter-state".into(), rx, ServiceEvent::AdapterState);
      Ok(())
   }

   async fn unsubscribe_adapter_state(&self) -> bool {
      self.manager.unsubscribe_adapter_state()
   }

   async fn subscribe_discovery(&self) -> fdo::Result<()> {
      let rx = self.manager.subscribe_discovery().map_err(to_fdo)?;
      self.forward("discovery".into(), rx, ServiceEvent::Discovery);
      Ok(())
   }

   async fn unsubscribe_discovery(&self) -> bool {
      self.manager.unsubscribe_discovery()
   }

   /// Generic entry point taking a JSON request, see [`control`].
   #[zbus(name = "Call")]
   async fn call_method(&self, request: String) -> String {
      control::handle_json(&self.manager, &request).await
   }

   // Signals
   #[zbus(signal)]
   pub async fn adapter_state_changed(emitter: &SignalEmitter<'_>, state: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_discovered(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_finished(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(
      emitter: &SignalEmitter<'_>,
      id: &str,
      data: &[u8],
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stream_ended(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn connection_count(&self) -> u32 {
      u32::try_from(self.manager.connection_count()).unwrap_or(u32::MAX)
   }
}

#[cfg(test)]
mod tests {
   use std::io;

   use super::*;
   use crate::permission::Permission;

   #[test]
   fn test_error_mapping() {
      assert!(matches!(
         to_fdo(BtError::InvalidArgument("bad".into())),
         fdo::Error::InvalidArgs(m) if m == "invalid_argument: Invalid argument: bad"
      ));
      assert!(matches!(
         to_fdo(BtError::PermissionDenied(Permission::Scan)),
         fdo::Error::AccessDenied(m) if m.starts_with("no_permissions: ")
      ));
      assert!(matches!(
         to_fdo(BtError::Unavailable),
         fdo::Error::NotSupported(m) if m.starts_with("bluetooth_unavailable: ")
      ));
      assert!(matches!(
         to_fdo(BtError::Write(io::Error::from(io::ErrorKind::BrokenPipe))),
         fdo::Error::Failed(m) if m.starts_with("write_error: ")
      ));
      assert!(matches!(
         to_fdo(BtError::NotFound("X".into())),
         fdo::Error::Failed(m) if m.starts_with("not_found: ")
      ));
   }
}
