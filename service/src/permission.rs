//! Permission gate checked before touching the radio.

use serde::{Deserialize, Serialize};

use crate::error::{BtError, Result};

/// Capabilities the gate can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
   /// Inquiry / device discovery.
   Scan,
   /// Opening connections and reading bonded devices.
   Connect,
}

/// Predicate deciding whether an operation may reach the adapter.
pub trait PermissionGate: Send + Sync {
   fn is_granted(&self, permission: Permission) -> bool;

   /// Fails with [`BtError::PermissionDenied`] when `permission` is missing.
   fn check(&self, permission: Permission) -> Result<()> {
      if self.is_granted(permission) {
         Ok(())
      } else {
         Err(BtError::PermissionDenied(permission))
      }
   }
}

impl<F> PermissionGate for F
where
   F: Fn(Permission) -> bool + Send + Sync,
{
   fn is_granted(&self, permission: Permission) -> bool {
      self(permission)
   }
}

/// Gate backed by the `[permissions]` table of the configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfigGate {
   #[serde(default = "granted")]
   pub scan: bool,
   #[serde(default = "granted")]
   pub connect: bool,
}

const fn granted() -> bool {
   true
}

impl Default for ConfigGate {
   fn default() -> Self {
      Self {
         scan: granted(),
         connect: granted(),
      }
   }
}

impl PermissionGate for ConfigGate {
   fn is_granted(&self, permission: Permission) -> bool {
      match permission {
         Permission::Scan => self.scan,
         Permission::Connect => self.connect,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_config_gate() {
      let gate = ConfigGate {
         scan: false,
         connect: true,
      };
      assert!(gate.check(Permission::Connect).is_ok());
      assert!(matches!(
         gate.check(Permission::Scan),
         Err(BtError::PermissionDenied(Permission::Scan))
      ));
   }

   #[test]
   fn test_closure_gate() {
      let gate = |p: Permission| p == Permission::Scan;
      assert!(gate.is_granted(Permission::Scan));
      assert!(!gate.is_granted(Permission::Connect));
      assert_eq!(Permission::Connect.to_string(), "connect");
   }
}
