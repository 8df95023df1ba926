//! Registry of live connections.
//!
//! The registry is the single source of truth for whether a connection is
//! alive. Every operation takes the lock once, so concurrent callers on the
//! same id observe each mutation atomically. Whoever removes an entry owns
//! its transport and read task from then on, and the id stays reserved until
//! that owner calls [`Registry::release`].

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use parking_lot::Mutex;

use crate::{
   connection::{ConnectionId, pump::ReadTask},
   error::{BtError, Result},
};

/// A live connection: its transport and, while streaming, its read pump.
#[derive(Debug)]
pub struct Connection<T> {
   id: ConnectionId,
   transport: Arc<T>,
   reader: Option<ReadTask>,
}

impl<T> Connection<T> {
   pub fn into_parts(self) -> (ConnectionId, Arc<T>, Option<ReadTask>) {
      (self.id, self.transport, self.reader)
   }
}

#[derive(Debug)]
struct Slots<T> {
   live: HashMap<ConnectionId, Connection<T>>,
   /// Removed, but the transport is still being closed.
   closing: HashSet<ConnectionId>,
}

impl<T> Slots<T> {
   fn check_vacant(&self, id: &str) -> Result<()> {
      if self.live.contains_key(id) {
         Err(BtError::DuplicateId(id.into()))
      } else if self.closing.contains(id) {
         Err(BtError::Closing(id.into()))
      } else {
         Ok(())
      }
   }

   fn take(&mut self, id: &str) -> Option<Connection<T>> {
      let conn = self.live.remove(id)?;
      self.closing.insert(conn.id.clone());
      Some(conn)
   }
}

#[derive(Debug)]
pub struct Registry<T> {
   slots: Mutex<Slots<T>>,
}

impl<T> Default for Registry<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T> Registry<T> {
   pub fn new() -> Self {
      Self {
         slots: Mutex::new(Slots {
            live: HashMap::new(),
            closing: HashSet::new(),
         }),
      }
   }

   /// Fails if `id` is live or still closing.
   pub fn check_vacant(&self, id: &str) -> Result<()> {
      self.slots.lock().check_vacant(id)
   }

   /// Registers a freshly opened transport under `id`.
   pub fn insert(&self, id: ConnectionId, transport: Arc<T>) -> Result<()> {
      let mut slots = self.slots.lock();
      slots.check_vacant(&id)?;
      slots.live.insert(
         id.clone(),
         Connection {
            id,
            transport,
            reader: None,
         },
      );
      Ok(())
   }

   /// Returns the transport of the live connection `id`.
   pub fn get(&self, id: &str) -> Result<Arc<T>> {
      self
         .slots
         .lock()
         .live
         .get(id)
         .map(|conn| conn.transport.clone())
         .ok_or_else(|| BtError::NotFound(id.into()))
   }

   pub fn contains(&self, id: &str) -> bool {
      self.slots.lock().live.contains_key(id)
   }

   /// Removes `id` and hands its connection to the caller. Only one of any
   /// number of concurrent callers receives it.
   pub fn remove(&self, id: &str) -> Result<Connection<T>> {
      self
         .slots
         .lock()
         .take(id)
         .ok_or_else(|| BtError::NotFound(id.into()))
   }

   /// Like [`Registry::remove`], but only while `id` still holds `transport`.
   /// A connection opened later under the same id is left alone.
   pub fn remove_owned(&self, id: &str, transport: &Arc<T>) -> Option<Connection<T>> {
      let mut slots = self.slots.lock();
      let owned = slots
         .live
         .get(id)
         .is_some_and(|conn| Arc::ptr_eq(&conn.transport, transport));
      if owned { slots.take(id) } else { None }
   }

   /// Removes every live connection, for shutdown.
   pub fn drain(&self) -> Vec<Connection<T>> {
      let mut slots = self.slots.lock();
      let drained: Vec<_> = slots.live.drain().map(|(_, conn)| conn).collect();
      slots
         .closing
         .extend(drained.iter().map(|conn| conn.id.clone()));
      drained
   }

   /// Frees `id` for reuse once its removed connection is closed.
   pub fn release(&self, id: &str) {
      self.slots.lock().closing.remove(id);
   }

   /// Attaches a read task to `id`. `spawn` runs under the registry lock, so
   /// the task cannot observe its entry without the handle in place; it is
   /// never invoked when the attach fails.
   pub fn attach_read_task<F>(&self, id: &str, spawn: F) -> Result<()>
   where
      F: FnOnce(ConnectionId, Arc<T>) -> ReadTask,
   {
      let mut slots = self.slots.lock();
      let conn = slots
         .live
         .get_mut(id)
         .ok_or_else(|| BtError::NotFound(id.into()))?;
      if conn.reader.is_some() {
         return Err(BtError::ListenerAttached(conn.id.clone()));
      }
      conn.reader = Some(spawn(conn.id.clone(), conn.transport.clone()));
      Ok(())
   }

   /// Takes the read task out of `id`, leaving the connection registered.
   pub fn detach_read_task(&self, id: &str) -> Result<Option<ReadTask>> {
      self
         .slots
         .lock()
         .live
         .get_mut(id)
         .map(|conn| conn.reader.take())
         .ok_or_else(|| BtError::NotFound(id.into()))
   }

   pub fn ids(&self) -> Vec<ConnectionId> {
      let mut ids: Vec<_> = self.slots.lock().live.keys().cloned().collect();
      ids.sort_unstable();
      ids
   }

   pub fn len(&self) -> usize {
      self.slots.lock().live.len()
   }

   #[cfg(test)]
   pub fn has_reader(&self, id: &str) -> bool {
      self
         .slots
         .lock()
         .live
         .get(id)
         .is_some_and(|conn| conn.reader.is_some())
   }
}
