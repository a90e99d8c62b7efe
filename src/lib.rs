//! LAN file transfer engine.
//!
//! Hosts on the same broadcast domain find each other through periodic
//! UDP announcements, then move files over direct TCP connections in
//! 1 MiB chunks, with progress reporting, optional password-based
//! AES-256-GCM encryption, and SHA-256 integrity verification.

pub mod core;
pub mod network;
pub mod platform;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use crate::core::{Config, PeerInfo};
pub use crate::network::{DiscoveryService, SocketEngine};
pub use crate::platform::{NativePlatform, Platform};
pub use crate::storage::FileIo;
pub use crate::transfer::{TransferInfo, TransferManager, TransferStatus};
pub use crate::utils::{LanError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
