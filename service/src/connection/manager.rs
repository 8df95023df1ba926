//! Connection manager.
//!
//! Public entry point for opening, streaming from, writing to and closing
//! serial connections. Every way a connection can end (an explicit
//! disconnect, a read or write failure, the listener going away) funnels
//! into [`teardown`], and the registry's atomic remove ensures exactly one
//! caller performs it.

use std::{
   collections::HashSet,
   io,
   str::FromStr,
   sync::Arc,
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::ToSmolStr;
use tokio::{sync::mpsc, time};

use crate::{
   bluetooth::{
      adapter::{DeviceInfo, RadioAdapter},
      transport::Transport,
   },
   config::Config,
   connection::{
      ConnectionId,
      pump::ReadTask,
      registry::{Connection, Registry},
   },
   error::{BtError, Result},
   event::{AdapterState, DiscoveryEvent, ReadEvent, ReadSink},
   permission::{Permission, PermissionGate},
};

/// How long an explicit teardown waits for the read pump to stop
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side started a teardown.
///
/// The writer and the read pump name the transport they hold, so a
/// connection opened under the same id after theirs was closed is left alone.
pub enum Initiator<'a, T> {
   Caller,
   Writer(&'a Arc<T>),
   ReadPump(&'a Arc<T>),
}

impl<T> Initiator<'_, T> {
   const fn name(&self) -> &'static str {
      match self {
         Self::Caller => "caller",
         Self::Writer(_) => "write failure",
         Self::ReadPump(_) => "read pump",
      }
   }
}

/// Removes `id` and releases its resources: cancels the read pump and
/// closes the transport, discarding any close error. Returns `false` when
/// `id` was not live, which makes repeated and concurrent calls harmless.
pub async fn teardown<T: Transport>(
   registry: &Registry<T>,
   id: &str,
   initiator: Initiator<'_, T>,
) -> bool {
   let removed = match initiator {
      Initiator::Caller => registry.remove(id).ok(),
      Initiator::Writer(owner) | Initiator::ReadPump(owner) => registry.remove_owned(id, owner),
   };
   let Some(conn) = removed else {
      debug!("{id}: already closed");
      return false;
   };

   // the pump cannot wait on itself
   let join_reader = !matches!(initiator, Initiator::ReadPump(_));
   close_connection(registry, conn, join_reader).await;
   info!("{id}: disconnected ({})", initiator.name());
   true
}

/// Closes a connection already taken out of `registry`, then frees its id.
async fn close_connection<T: Transport>(
   registry: &Registry<T>,
   conn: Connection<T>,
   join_reader: bool,
) {
   let (id, transport, reader) = conn.into_parts();
   let _closing = ClosingGuard {
      registry,
      id: &id,
   };

   if let Some(reader) = reader {
      reader.cancel();
      if join_reader {
         reader.join(PUMP_JOIN_TIMEOUT).await;
      }
   }
   if let Err(e) = transport.close().await {
      debug!("{id}: ignoring close error: {e}");
   }
}

/// Keeps an id reserved until its close finishes, or is abandoned.
struct ClosingGuard<'a, T> {
   registry: &'a Registry<T>,
   id: &'a str,
}

impl<T> Drop for ClosingGuard<'_, T> {
   fn drop(&mut self) {
      self.registry.release(self.id);
   }
}

/// Marks an id as connecting for as long as the guard lives.
struct PendingConnect<'a> {
   pending: &'a Mutex<HashSet<ConnectionId>>,
   id: ConnectionId,
}

impl<'a> PendingConnect<'a> {
   fn begin(pending: &'a Mutex<HashSet<ConnectionId>>, id: ConnectionId) -> Result<Self> {
      if !pending.lock().insert(id.clone()) {
         return Err(BtError::AlreadyConnecting(id));
      }
      Ok(Self { pending, id })
   }
}

impl Drop for PendingConnect<'_> {
   fn drop(&mut self) {
      self.pending.lock().remove(&self.id);
   }
}

/// Parses a device address and derives its connection id.
pub fn connection_id(address: &str) -> Result<(Address, ConnectionId)> {
   let addr = Address::from_str(address.trim())
      .map_err(|e| BtError::InvalidArgument(format!("{address:?}: {e}")))?;
   Ok((addr, addr.to_smolstr()))
}

/// Manages serial connections over a [`RadioAdapter`].
pub struct ConnectionManager<A: RadioAdapter> {
   adapter: A,
   gate: Box<dyn PermissionGate>,
   registry: Arc<Registry<A::Transport>>,
   pending: Mutex<HashSet<ConnectionId>>,
   connect_timeout: Duration,
   write_timeout: Duration,
   read_buffer_size: usize,
   listener_capacity: usize,
}

impl<A: RadioAdapter> ConnectionManager<A> {
   pub fn new(adapter: A, gate: impl PermissionGate + 'static, config: &Config) -> Self {
      Self {
         adapter,
         gate: Box::new(gate),
         registry: Arc::new(Registry::new()),
         pending: Mutex::new(HashSet::new()),
         connect_timeout: config.connect_timeout(),
         write_timeout: config.write_timeout(),
         read_buffer_size: config.read_buffer_size,
         listener_capacity: config.listener_capacity,
      }
   }

   #[cfg(test)]
   pub const fn adapter(&self) -> &A {
      &self.adapter
   }

   fn ensure_available(&self) -> Result<()> {
      if self.adapter.is_available() {
         Ok(())
      } else {
         Err(BtError::Unavailable)
      }
   }

   // === Adapter ===

   pub fn is_available(&self) -> bool {
      self.adapter.is_available()
   }

   pub async fn is_enabled(&self) -> Result<bool> {
      self.ensure_available()?;
      self.adapter.is_enabled().await
   }

   pub async fn is_discovering(&self) -> Result<bool> {
      self.ensure_available()?;
      self.adapter.is_discovering().await
   }

   pub async fn start_discovery(&self) -> Result<()> {
      self.ensure_available()?;
      self.gate.check(Permission::Scan)?;
      info!("Starting discovery");
      self.adapter.start_discovery().await
   }

   pub async fn cancel_discovery(&self) -> Result<()> {
      self.ensure_available()?;
      self.gate.check(Permission::Scan)?;
      info!("Cancelling discovery");
      self.adapter.cancel_discovery().await
   }

   pub async fn bonded_devices(&self) -> Result<Vec<DeviceInfo>> {
      self.ensure_available()?;
      self.gate.check(Permission::Connect)?;
      self.adapter.bonded_devices().await
   }

   pub fn subscribe_adapter_state(&self) -> Result<mpsc::Receiver<AdapterState>> {
      self.ensure_available()?;
      Ok(self.adapter.state_events().subscribe(self.listener_capacity))
   }

   pub fn unsubscribe_adapter_state(&self) -> bool {
      self.adapter.state_events().unsubscribe()
   }

   pub fn subscribe_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
      self.ensure_available()?;
      self.gate.check(Permission::Scan)?;
      Ok(self.adapter.discovery_events().subscribe(self.listener_capacity))
   }

   pub fn unsubscribe_discovery(&self) -> bool {
      self.adapter.discovery_events().unsubscribe()
   }

   // === Connections ===

   /// Opens a connection to `address`. The connection id is the canonical
   /// form of the address.
   pub async fn connect(&self, address: &str) -> Result<ConnectionId> {
      self.ensure_available()?;
      self.gate.check(Permission::Connect)?;
      let (addr, id) = connection_id(address)?;

      self.registry.check_vacant(&id)?;
      let _pending = PendingConnect::begin(&self.pending, id.clone())?;

      info!("Connecting to {id}");
      let opened = time::timeout(self.connect_timeout, self.adapter.open_transport(addr)).await;
      let transport = match opened {
         Ok(Ok(transport)) => Arc::new(transport),
         Ok(Err(e)) => {
            warn!("Failed to connect to {id}: {e}");
            return Err(BtError::Connection(e));
         },
         Err(_) => {
            warn!("Connection to {id} timed out");
            return Err(BtError::Connection(io::Error::new(
               io::ErrorKind::TimedOut,
               format!("no connection within {:?}", self.connect_timeout),
            )));
         },
      };

      if let Err(e) = self.registry.insert(id.clone(), transport.clone()) {
         warn!("{id}: connected twice, closing the newer stream");
         if let Err(e) = transport.close().await {
            debug!("{id}: ignoring close error: {e}");
         }
         return Err(e);
      }

      info!("Connected to {id}");
      Ok(id)
   }

   /// Closes `id`. Closing an unknown or already closed connection is a no-op.
   pub async fn disconnect(&self, id: &str) -> Result<()> {
      self.ensure_available()?;
      teardown(&self.registry, id, Initiator::Caller).await;
      Ok(())
   }

   /// Writes `data` to `id`. A failed write closes the connection.
   pub async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
      self.ensure_available()?;
      let transport = self.registry.get(id)?;

      let result = match time::timeout(self.write_timeout, transport.write(data)).await {
         Ok(result) => result,
         Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write not flushed within {:?}", self.write_timeout),
         )),
      };

      if let Err(e) = result {
         warn!("{id}: write failed: {e}");
         teardown(&self.registry, id, Initiator::Writer(&transport)).await;
         return Err(BtError::Write(e));
      }
      Ok(())
   }

   /// Starts streaming `id`'s inbound data into `sink`. Fails if `id` is not
   /// live or already has a listener.
   pub fn attach_listener(&self, id: &str, sink: ReadSink) -> Result<()> {
      self.ensure_available()?;
      let registry = Arc::downgrade(&self.registry);
      let buffer_size = self.read_buffer_size;
      self
         .registry
         .attach_read_task(id, |id, transport| {
            ReadTask::spawn(id, transport, sink, registry, buffer_size)
         })?;
      info!("{id}: listener attached");
      Ok(())
   }

   /// Creates a read stream for `id` and attaches it as the listener.
   /// Dropping the receiver closes the connection.
   pub fn open_read_stream(&self, id: &str) -> Result<mpsc::Receiver<ReadEvent>> {
      let (tx, rx) = mpsc::channel(self.listener_capacity.max(1));
      self.attach_listener(id, tx)?;
      Ok(rx)
   }

   /// Stops streaming `id` without closing it. A new listener may be
   /// attached afterwards.
   pub async fn detach_listener(&self, id: &str) -> Result<()> {
      self.ensure_available()?;
      if let Some(reader) = self.registry.detach_read_task(id)? {
         reader.cancel();
         reader.join(PUMP_JOIN_TIMEOUT).await;
         info!("{id}: listener detached");
      }
      Ok(())
   }

   pub fn is_connected(&self, id: &str) -> bool {
      self.registry.contains(id)
   }

   pub fn connection_ids(&self) -> Vec<ConnectionId> {
      self.registry.ids()
   }

   pub fn connection_count(&self) -> usize {
      self.registry.len()
   }

   /// Closes every live connection. Ids stay reserved until their close
   /// completes.
   pub async fn shutdown(&self) {
      let drained = self.registry.drain();
      info!("Closing {} connections", drained.len());
      for conn in drained {
         close_connection(&self.registry, conn, true).await;
      }
   }
}
