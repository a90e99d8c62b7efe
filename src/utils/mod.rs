pub mod crypto;
pub mod error;
pub mod logger;
pub mod net;

pub use error::{LanError, Result};
pub use logger::setup_logging;

/// Epoch milliseconds from the system clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
