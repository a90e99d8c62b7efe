use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default TCP port for file transfers.
pub const DEFAULT_TRANSFER_PORT: u16 = 34568;

/// Reserved UDP discovery port. Passing it selects a random port in
/// [40000, 49999] instead; any other value is used verbatim.
pub const DEFAULT_DISCOVERY_PORT: u16 = 34567;

pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 15000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Name shown to other peers. Defaults to "User on <platform>".
    pub display_name: Option<String>,
    pub transfer_port: u16,
    pub discovery_port: u16,
    pub announce_interval_ms: u64,
    pub peer_timeout_ms: u64,
    /// Override the announcement destination ("host:port"). When unset,
    /// announcements are broadcast to the discovery port.
    pub announce_target: Option<String>,
    /// Where incoming files land. Defaults to the platform download dir.
    pub download_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            transfer_port: DEFAULT_TRANSFER_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            announce_target: None,
            download_dir: None,
        }
    }
}
