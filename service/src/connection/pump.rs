//! Read pump: drains one connection's transport into its listener.
//!
//! Each chunk returned by a transport read is forwarded as one
//! [`ReadEvent::Data`], in order. The pump stops on the first of:
//! cancellation, end of stream, read error, or the listener going away.
//! Cancellation is checked before every read and every emission, and once
//! observed nothing further reaches the listener.

use std::{
   sync::{Arc, Weak},
   time::Duration,
};

use log::{debug, warn};
use tokio::{select, sync::watch, task::JoinHandle, time};

use crate::{
   bluetooth::transport::Transport,
   connection::{
      ConnectionId,
      manager::{Initiator, teardown},
      registry::Registry,
   },
   event::{ReadEvent, ReadSink},
};

/// Why a read pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
   /// Cancelled by the manager.
   Cancelled,
   /// The listener dropped its end of the stream.
   ListenerGone,
   /// The remote end closed the stream.
   Ended,
   /// A read failed.
   Failed,
}

/// Handle to a running read pump.
///
/// Dropping the handle cancels the pump.
#[derive(Debug)]
pub struct ReadTask {
   cancel: watch::Sender<bool>,
   handle: JoinHandle<PumpExit>,
}

impl ReadTask {
   pub fn spawn<T: Transport>(
      id: ConnectionId,
      transport: Arc<T>,
      sink: ReadSink,
      registry: Weak<Registry<T>>,
      buffer_size: usize,
   ) -> Self {
      let (cancel, cancelled) = watch::channel(false);
      let handle = tokio::spawn(run(id, transport, sink, cancelled, registry, buffer_size));
      Self { cancel, handle }
   }

   /// Requests cancellation. The pump emits nothing once it observes it.
   pub fn cancel(&self) {
      self.cancel.send_replace(true);
   }

   #[cfg(test)]
   pub fn is_cancelled(&self) -> bool {
      *self.cancel.borrow()
   }

   #[cfg(test)]
   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }

   /// Waits up to `timeout` for the pump to stop.
   pub async fn join(self, timeout: Duration) -> Option<PumpExit> {
      match time::timeout(timeout, self.handle).await {
         Ok(Ok(exit)) => Some(exit),
         Ok(Err(e)) => {
            warn!("Read pump panicked: {e}");
            None
         },
         Err(_) => {
            warn!("Read pump did not stop within {timeout:?}");
            None
         },
      }
   }

   /// A task that does nothing until cancelled.
   #[cfg(test)]
   pub fn idle() -> Self {
      let (cancel, mut cancelled) = watch::channel(false);
      let handle = tokio::spawn(async move {
         let _ = cancelled.wait_for(|c| *c).await;
         PumpExit::Cancelled
      });
      Self { cancel, handle }
   }

   /// Like [`ReadTask::spawn`], also reporting the exit on a side channel
   /// for when the handle itself is consumed by a teardown.
   #[cfg(test)]
   pub fn spawn_observed<T: Transport>(
      id: ConnectionId,
      transport: Arc<T>,
      sink: ReadSink,
      registry: Weak<Registry<T>>,
      buffer_size: usize,
   ) -> (Self, tokio::sync::oneshot::Receiver<PumpExit>) {
      let (cancel, cancelled) = watch::channel(false);
      let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
      let handle = tokio::spawn(async move {
         let exit = run(id, transport, sink, cancelled, registry, buffer_size).await;
         let _ = exit_tx.send(exit);
         exit
      });
      (Self { cancel, handle }, exit_rx)
   }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
   // a dropped handle counts as cancellation
   *cancel.borrow() || cancel.has_changed().is_err()
}

async fn run<T: Transport>(
   id: ConnectionId,
   transport: Arc<T>,
   sink: ReadSink,
   mut cancel: watch::Receiver<bool>,
   registry: Weak<Registry<T>>,
   buffer_size: usize,
) -> PumpExit {
   debug!("{id}: read pump started");
   let mut buf = vec![0u8; buffer_size.max(1)];

   let exit = loop {
      let read = select! {
         biased;
         _ = cancel.wait_for(|c| *c) => break PumpExit::Cancelled,
         () = sink.closed() => break PumpExit::ListenerGone,
         read = transport.read(&mut buf) => read,
      };

      let n = match read {
         Ok(0) => break PumpExit::Ended,
         Ok(n) => n,
         Err(e) => {
            warn!("{id}: read failed: {e}");
            break PumpExit::Failed;
         },
      };

      let chunk = &buf[..n];
      debug!("← {id}: {}", hex::encode(chunk));
      if is_cancelled(&cancel) {
         break PumpExit::Cancelled;
      }
      select! {
         biased;
         _ = cancel.wait_for(|c| *c) => break PumpExit::Cancelled,
         sent = sink.send(ReadEvent::Data(chunk.to_vec())) => {
            if sent.is_err() {
               break PumpExit::ListenerGone;
            }
         }
      }
   };

   match exit {
      PumpExit::Ended | PumpExit::Failed => {
         if !is_cancelled(&cancel) {
            select! {
               biased;
               _ = cancel.wait_for(|c| *c) => {},
               _ = sink.send(ReadEvent::Ended) => {},
            }
         }
         release(&registry, &id, &transport).await;
      },
      PumpExit::ListenerGone => {
         debug!("{id}: listener went away");
         release(&registry, &id, &transport).await;
      },
      PumpExit::Cancelled => {},
   }

   debug!("{id}: read pump stopped ({exit:?})");
   exit
}

/// Tears down the connection this pump reads from, unless it is already
/// gone or was replaced under the same id.
async fn release<T: Transport>(
   registry: &Weak<Registry<T>>,
   id: &ConnectionId,
   transport: &Arc<T>,
) {
   if let Some(registry) = registry.upgrade() {
      teardown(&registry, id, Initiator::ReadPump(transport)).await;
   }
}
