//! Event types and delivery channels.
//!
//! The service exposes three independent streams: adapter state changes,
//! discovery results, and per-connection inbound data. Each stream is
//! delivered through a channel that may or may not have a subscriber;
//! events emitted while nobody listens are dropped.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::connection::ConnectionId;

/// Power / discoverability state of the local radio.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdapterState {
   Off,
   On,
   Discoverable,
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
   pub name: Option<String>,
   pub address: String,
   pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
   Found(DiscoveredDevice),
   /// Discovery stopped, either cancelled or timed out.
   Finished,
}

/// Event delivered on a connection's read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
   /// One chunk, exactly as returned by a single transport read.
   Data(Vec<u8>),
   /// The stream ended or failed; no further events follow.
   Ended,
}

/// Listener end of a connection's read stream.
pub type ReadSink = mpsc::Sender<ReadEvent>;

/// Single-subscriber event channel.
///
/// Subscribing replaces any previous subscriber, whose receiver then
/// observes the end of the stream.
#[derive(Debug)]
pub struct EventChannel<E> {
   name: &'static str,
   tx: Mutex<Option<mpsc::Sender<E>>>,
}

impl<E> EventChannel<E> {
   pub const fn new(name: &'static str) -> Self {
      Self {
         name,
         tx: Mutex::new(None),
      }
   }

   /// Attaches a new subscriber and returns its receiving end.
   pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<E> {
      let (tx, rx) = mpsc::channel(capacity.max(1));
      if self.tx.lock().replace(tx).is_some() {
         debug!("{}: replacing previous subscriber", self.name);
      }
      rx
   }

   /// Detaches the current subscriber. Returns whether one was attached.
   pub fn unsubscribe(&self) -> bool {
      self.tx.lock().take().is_some()
   }

   #[cfg(test)]
   pub fn is_subscribed(&self) -> bool {
      self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
   }

   /// Delivers `event` to the subscriber, if any. Returns whether it was queued.
   pub fn emit(&self, event: E) -> bool {
      let mut lock = self.tx.lock();
      let Some(tx) = lock.as_ref() else {
         return false;
      };
      match tx.try_send(event) {
         Ok(()) => true,
         Err(TrySendError::Full(_)) => {
            warn!("{}: subscriber lagging, dropping event", self.name);
            false
         },
         Err(TrySendError::Closed(_)) => {
            debug!("{}: subscriber went away", self.name);
            *lock = None;
            false
         },
      }
   }
}

/// Events forwarded to the outside world by the service.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
   AdapterState(AdapterState),
   Discovery(DiscoveryEvent),
   Read(ConnectionId, ReadEvent),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ServiceEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
