//! Serial connection lifecycle.
//!
//! The [`registry`] tracks live connections, a [`pump`] per listening
//! connection forwards inbound data, and the [`manager`] ties both to a
//! radio adapter.

use smol_str::SmolStr;

pub mod manager;
#[cfg(test)]
pub mod mock;
pub mod pump;
pub mod registry;

pub use manager::ConnectionManager;

/// Identifier of a live connection: the remote address in canonical
/// upper-case colon form.
pub type ConnectionId = SmolStr;
