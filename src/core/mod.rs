pub mod config;
pub mod peer;
pub mod protocol;

pub use config::Config;
pub use peer::{PeerInfo, PeerTable};
pub use protocol::{Envelope, MessageBody};
