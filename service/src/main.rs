//! Bluetooth serial D-Bus service
//!
//! This service manages RFCOMM serial connections to classic Bluetooth
//! devices and exposes discovery, connection and streaming over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, object_server::InterfaceRef};

use bluetooth::adapter::BluerAdapter;
use connection::ConnectionManager;
use dbus::BtSerialService;
use event::{DiscoveryEvent, EventBus, ReadEvent, ServiceEvent};

mod bluetooth;
mod config;
mod connection;
mod control;
mod dbus;
mod error;
mod event;
mod permission;

use crate::{dbus::BtSerialServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/btserial/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btseriald D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   match config.rfcomm_channel {
      Some(channel) => info!(
         "Loaded configuration (RFCOMM channel {channel}, connect timeout {}s)",
         config.connect_timeout_sec
      ),
      None => info!(
         "Loaded configuration (serial port profile lookup, connect timeout {}s)",
         config.connect_timeout_sec
      ),
   }

   // Create event channel
   let event_bus = EventProcessor::new();

   // Open the radio and build the connection manager on top of it
   let adapter = BluerAdapter::new(&config).await?;
   let manager = Arc::new(ConnectionManager::new(adapter, config.permissions, &config));

   // Create D-Bus service
   let service = BtSerialService::new(manager.clone(), event_bus.clone());

   // Build D-Bus connection
   let connection = zbus::connection::Builder::session()?
      .name("org.btserial")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btseriald D-Bus service started at org.btserial");

   // Start event processor
   event_bus.spawn_dispatcher(connection.clone()).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btseriald...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<ServiceEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<ServiceEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BtSerialService>, event: ServiceEvent) -> Result<()> {
      match event {
         ServiceEvent::AdapterState(state) => {
            iface.adapter_state_changed(state.into()).await?;
         },
         ServiceEvent::Discovery(DiscoveryEvent::Found(device)) => {
            iface
               .device_discovered(&serde_json::to_string(&device)?)
               .await?;
         },
         ServiceEvent::Discovery(DiscoveryEvent::Finished) => {
            iface.discovery_finished().await?;
         },
         ServiceEvent::Read(id, ReadEvent::Data(data)) => {
            iface.data_received(&id, &data).await?;
         },
         ServiceEvent::Read(id, ReadEvent::Ended) => {
            iface.stream_ended(&id).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BtSerialService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ServiceEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
