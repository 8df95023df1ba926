//! In-memory transport and adapter used by the unit tests.

use std::{
   collections::HashMap,
   future, io,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use parking_lot::Mutex;
use tokio::{
   sync::{Notify, mpsc},
   time,
};

use crate::{
   bluetooth::{
      adapter::{DeviceInfo, RadioAdapter},
      transport::Transport,
   },
   error::{BtError, Result},
   event::{AdapterState, DiscoveryEvent, EventChannel},
};

#[derive(Debug)]
struct MockInner {
   incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
   written: Mutex<Vec<Vec<u8>>>,
   closes: AtomicUsize,
   fail_writes: AtomicBool,
   fail_close: AtomicBool,
   hold_close: AtomicBool,
   close_released: Notify,
}

/// Scripted transport. Reads return whatever the paired [`MockFeed`]
/// pushes; dropping the feed ends the stream.
#[derive(Debug, Clone)]
pub struct MockTransport(Arc<MockInner>);

/// Sending side of a [`MockTransport`]'s read script.
pub struct MockFeed(mpsc::UnboundedSender<io::Result<Vec<u8>>>);

impl MockFeed {
   pub fn data(&self, bytes: &[u8]) {
      let _ = self.0.send(Ok(bytes.to_vec()));
   }

   pub fn error(&self, kind: io::ErrorKind) {
      let _ = self.0.send(Err(io::Error::from(kind)));
   }
}

impl MockTransport {
   pub fn new() -> (Self, MockFeed) {
      let (tx, rx) = mpsc::unbounded_channel();
      let inner = MockInner {
         incoming: tokio::sync::Mutex::new(rx),
         written: Mutex::new(Vec::new()),
         closes: AtomicUsize::new(0),
         fail_writes: AtomicBool::new(false),
         fail_close: AtomicBool::new(false),
         hold_close: AtomicBool::new(false),
         close_released: Notify::new(),
      };
      (Self(Arc::new(inner)), MockFeed(tx))
   }

   pub fn closes(&self) -> usize {
      self.0.closes.load(Ordering::SeqCst)
   }

   pub fn written(&self) -> Vec<Vec<u8>> {
      self.0.written.lock().clone()
   }

   pub fn fail_writes(&self) {
      self.0.fail_writes.store(true, Ordering::SeqCst);
   }

   pub fn fail_close(&self) {
      self.0.fail_close.store(true, Ordering::SeqCst);
   }

   /// Makes `close` block until [`MockTransport::release_close`].
   pub fn hold_close(&self) {
      self.0.hold_close.store(true, Ordering::SeqCst);
   }

   pub fn release_close(&self) {
      self.0.hold_close.store(false, Ordering::SeqCst);
      self.0.close_released.notify_one();
   }
}

impl Transport for MockTransport {
   async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      match self.0.incoming.lock().await.recv().await {
         Some(Ok(chunk)) => {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
         },
         Some(Err(e)) => Err(e),
         None => Ok(0),
      }
   }

   async fn write(&self, data: &[u8]) -> io::Result<()> {
      if self.0.fail_writes.load(Ordering::SeqCst) {
         return Err(io::Error::from(io::ErrorKind::BrokenPipe));
      }
      self.0.written.lock().push(data.to_vec());
      Ok(())
   }

   async fn close(&self) -> io::Result<()> {
      self.0.closes.fetch_add(1, Ordering::SeqCst);
      if self.0.hold_close.load(Ordering::SeqCst) {
         self.0.close_released.notified().await;
      }
      if self.0.fail_close.load(Ordering::SeqCst) {
         return Err(io::Error::from(io::ErrorKind::NotConnected));
      }
      Ok(())
   }
}

/// What the next `open_transport` for an address does.
pub enum Script {
   Open(MockTransport),
   Fail(io::ErrorKind),
   Hang,
}

pub struct MockAdapter {
   available: bool,
   scripts: Mutex<HashMap<Address, Script>>,
   opens: AtomicUsize,
   discovery_starts: AtomicUsize,
   state: EventChannel<AdapterState>,
   discovery: EventChannel<DiscoveryEvent>,
   bonded: Vec<DeviceInfo>,
}

impl MockAdapter {
   pub fn new() -> Self {
      Self {
         available: true,
         scripts: Mutex::new(HashMap::new()),
         opens: AtomicUsize::new(0),
         discovery_starts: AtomicUsize::new(0),
         state: EventChannel::new("mock-state"),
         discovery: EventChannel::new("mock-discovery"),
         bonded: vec![DeviceInfo {
            name: Some("HC-05".into()),
            address: "00:11:22:33:44:55".into(),
            serial_port: true,
         }],
      }
   }

   pub fn unavailable() -> Self {
      Self {
         available: false,
         ..Self::new()
      }
   }

   pub fn script(&self, address: &str, script: Script) {
      let address = address.parse().expect("valid address");
      self.scripts.lock().insert(address, script);
   }

   /// Scripts a successful open and returns the transport with its feed.
   pub fn expect_open(&self, address: &str) -> (MockTransport, MockFeed) {
      let (transport, feed) = MockTransport::new();
      self.script(address, Script::Open(transport.clone()));
      (transport, feed)
   }

   pub fn opens(&self) -> usize {
      self.opens.load(Ordering::SeqCst)
   }

   pub fn discovery_starts(&self) -> usize {
      self.discovery_starts.load(Ordering::SeqCst)
   }

   fn ensure(&self) -> Result<()> {
      if self.available {
         Ok(())
      } else {
         Err(BtError::Unavailable)
      }
   }
}

impl RadioAdapter for MockAdapter {
   type Transport = MockTransport;

   fn is_available(&self) -> bool {
      self.available
   }

   async fn is_enabled(&self) -> Result<bool> {
      self.ensure()?;
      Ok(true)
   }

   async fn is_discovering(&self) -> Result<bool> {
      self.ensure()?;
      Ok(self.discovery_starts() > 0)
   }

   async fn start_discovery(&self) -> Result<()> {
      self.ensure()?;
      self.discovery_starts.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }

   async fn cancel_discovery(&self) -> Result<()> {
      self.ensure()?;
      self.discovery.emit(DiscoveryEvent::Finished);
      Ok(())
   }

   async fn bonded_devices(&self) -> Result<Vec<DeviceInfo>> {
      self.ensure()?;
      Ok(self.bonded.clone())
   }

   async fn open_transport(&self, address: Address) -> io::Result<MockTransport> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      let script = self.scripts.lock().remove(&address);
      match script {
         Some(Script::Open(transport)) => Ok(transport),
         Some(Script::Fail(kind)) => Err(io::Error::from(kind)),
         Some(Script::Hang) => future::pending().await,
         None => Err(io::Error::from(io::ErrorKind::HostUnreachable)),
      }
   }

   fn state_events(&self) -> &EventChannel<AdapterState> {
      &self.state
   }

   fn discovery_events(&self) -> &EventChannel<DiscoveryEvent> {
      &self.discovery
   }
}

/// Polls `cond` until it holds, failing the test after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
   for _ in 0..200 {
      if cond() {
         return;
      }
      time::sleep(Duration::from_millis(5)).await;
   }
   panic!("condition not reached in time");
}
