//! Configuration management for the serial connection service.
//!
//! This module handles loading and saving configuration from disk,
//! including connection timeouts, buffer sizes and permissions.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{BtError, Result},
   permission::ConfigGate,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Fixed RFCOMM channel. When unset the channel is looked up through
   /// the device's serial port profile record.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub rfcomm_channel: Option<u8>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_sec: u64,

   #[serde(default = "default_read_buffer_size")]
   pub read_buffer_size: usize,

   #[serde(default = "default_listener_capacity")]
   pub listener_capacity: usize,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,

   #[serde(default)]
   pub permissions: ConfigGate,
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_write_timeout() -> u64 {
   25
}

const fn default_read_buffer_size() -> usize {
   1024
}

const fn default_listener_capacity() -> usize {
   128
}

const fn default_discovery_timeout() -> u64 {
   12
}

impl Default for Config {
   fn default() -> Self {
      Self {
         rfcomm_channel: None,
         connect_timeout_sec: default_connect_timeout(),
         write_timeout_sec: default_write_timeout(),
         read_buffer_size: default_read_buffer_size(),
         listener_capacity: default_listener_capacity(),
         discovery_timeout_sec: default_discovery_timeout(),
         permissions: ConfigGate::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTSERIAL_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(BtError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btseriald").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn write_timeout(&self) -> Duration {
      Duration::from_secs(self.write_timeout_sec)
   }

   pub const fn discovery_timeout(&self) -> Duration {
      Duration::from_secs(self.discovery_timeout_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_load_creates_default() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("btseriald").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config.rfcomm_channel, None);
      assert_eq!(config.read_buffer_size, 1024);
      assert!(!fs::read_to_string(&path).unwrap().contains("rfcomm_channel"));
      assert!(config.permissions.scan && config.permissions.connect);
   }

   #[test]
   fn test_partial_file_fills_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "rfcomm_channel = 3\nwrite_timeout_sec = 5\n\n[permissions]\nscan = false\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.rfcomm_channel, Some(3));
      assert_eq!(config.write_timeout(), Duration::from_secs(5));
      assert_eq!(config.connect_timeout(), Duration::from_secs(10));
      assert!(!config.permissions.scan);
      assert!(config.permissions.connect);
   }

   #[test]
   fn test_save_roundtrip() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         rfcomm_channel: Some(2),
         listener_capacity: 16,
         discovery_timeout_sec: 30,
         ..Default::default()
      };
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.rfcomm_channel, Some(2));
      assert_eq!(loaded.listener_capacity, 16);
      assert_eq!(loaded.discovery_timeout(), Duration::from_secs(30));
   }

   #[test]
   fn test_malformed_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "rfcomm_channel = \"one\"").unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(BtError::TomlParse(_))
      ));
   }
}
