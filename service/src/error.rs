//! Error types for the serial connection service.
//!
//! Every failure surfaced by the service is a [`BtError`]. Each variant
//! carries a stable code string (see [`BtError::code`]) that the control
//! surface hands back to callers.

use std::io;

use thiserror::Error;

use crate::{connection::ConnectionId, permission::Permission};

/// Main error type for the serial connection service.
#[derive(Error, Debug)]
pub enum BtError {
   #[error("Bluetooth adapter not available")]
   Unavailable,

   #[error("Missing Bluetooth permission: {0}")]
   PermissionDenied(Permission),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Connection not found: {0}")]
   NotFound(ConnectionId),

   #[error("Already connected to {0}")]
   DuplicateId(ConnectionId),

   #[error("Still closing the previous connection to {0}")]
   Closing(ConnectionId),

   #[error("Already connecting to {0}")]
   AlreadyConnecting(ConnectionId),

   #[error("Listener already attached to {0}")]
   ListenerAttached(ConnectionId),

   #[error("Could not connect: {0}")]
   Connection(#[source] io::Error),

   #[error("Write failed: {0}")]
   Write(#[source] io::Error),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl BtError {
   /// Stable, machine-readable code for this error.
   pub const fn code(&self) -> &'static str {
      match self {
         Self::Unavailable => "bluetooth_unavailable",
         Self::PermissionDenied(_) => "no_permissions",
         Self::InvalidArgument(_) => "invalid_argument",
         Self::NotFound(_) => "not_found",
         Self::DuplicateId(_) => "already_connected",
         Self::Closing(_) => "closing",
         Self::AlreadyConnecting(_) => "already_connecting",
         Self::ListenerAttached(_) => "listener_attached",
         Self::Connection(_) => "connection_error",
         Self::Write(_) => "write_error",
         Self::Bluetooth(_) => "bluetooth_error",
         Self::DBus(_)
         | Self::Io(_)
         | Self::Json(_)
         | Self::ConfigDirNotFound
         | Self::TomlParse(_)
         | Self::TomlSerialize(_) => "internal_error",
      }
   }
}

/// Convenience type alias for Results with `BtError`.
pub type Result<T> = std::result::Result<T, BtError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_codes_are_stable() {
      assert_eq!(BtError::Unavailable.code(), "bluetooth_unavailable");
      assert_eq!(
         BtError::PermissionDenied(Permission::Scan).code(),
         "no_permissions"
      );
      assert_eq!(BtError::NotFound("x".into()).code(), "not_found");
      assert_eq!(BtError::DuplicateId("x".into()).code(), "already_connected");
      assert_eq!(BtError::Closing("x".into()).code(), "closing");
      assert_eq!(
         BtError::Write(io::Error::from(io::ErrorKind::BrokenPipe)).code(),
         "write_error"
      );
      assert_eq!(BtError::ConfigDirNotFound.code(), "internal_error");
   }

   #[test]
   fn test_messages() {
      let err = BtError::Connection(io::Error::from(io::ErrorKind::TimedOut));
      assert_eq!(err.code(), "connection_error");
      assert!(err.to_string().starts_with("Could not connect: "));
      assert_eq!(
         BtError::ListenerAttached("AA:BB:CC:DD:EE:FF".into()).to_string(),
         "Listener already attached to AA:BB:CC:DD:EE:FF"
      );
   }
}
