pub mod discovery;
pub mod socket;

pub use discovery::DiscoveryService;
pub use socket::{ConnectionStatus, DataCallback, SocketEngine, StatusCallback};
