//! Byte-stream transports to remote devices.
//!
//! A [`Transport`] is a bidirectional stream bound to one remote address.
//! Reads and writes may run concurrently from different tasks, so every
//! operation takes `&self`.

use std::{future::Future, io};

use bluer::{
   Address,
   rfcomm::{SocketAddr, Stream},
};
use log::debug;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::Mutex,
};

/// Open bidirectional byte stream to a single remote device.
pub trait Transport: Send + Sync + 'static {
   /// Reads into `buf`, returning the number of bytes read. `Ok(0)` means
   /// the remote end closed the stream.
   fn read(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

   /// Writes all of `data` and flushes it.
   fn write(&self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

   /// Shuts the stream down.
   fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// RFCOMM stream to a serial-port service.
#[derive(Debug)]
pub struct RfcommTransport {
   address: Address,
   reader: Mutex<ReadHalf<Stream>>,
   writer: Mutex<WriteHalf<Stream>>,
}

impl RfcommTransport {
   /// Connects to `address` on a fixed RFCOMM `channel`, skipping the
   /// service lookup.
   pub async fn connect(address: Address, channel: u8) -> io::Result<Self> {
      debug!("Connecting to {address} on RFCOMM channel {channel}");
      let stream = Stream::connect(SocketAddr::new(address, channel)).await?;
      Ok(Self::from_stream(address, stream))
   }

   /// Wraps a stream that is already connected, e.g. one handed over by
   /// BlueZ for a profile connection.
   pub fn from_stream(address: Address, stream: Stream) -> Self {
      let (reader, writer) = tokio::io::split(stream);
      Self {
         address,
         reader: Mutex::new(reader),
         writer: Mutex::new(writer),
      }
   }
}

impl Transport for RfcommTransport {
   async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      self.reader.lock().await.read(buf).await
   }

   async fn write(&self, data: &[u8]) -> io::Result<()> {
      debug!("→ {}: {}", self.address, hex::encode(data));
      let mut writer = self.writer.lock().await;
      writer.write_all(data).await?;
      writer.flush().await
   }

   async fn close(&self) -> io::Result<()> {
      debug!("Closing RFCOMM stream to {}", self.address);
      self.writer.lock().await.shutdown().await
   }
}
