pub mod manager;
pub(crate) mod receiver;
pub(crate) mod sender;

pub use manager::{TransferManager, TransferRequestCallback, TransferStatusCallback};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Initializing,
    Waiting,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Initializing => "initializing",
            TransferStatus::Waiting => "waiting",
            TransferStatus::InProgress => "in progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// The record of one file transfer. A plain value: all mutation goes
/// through the manager's registry, observers only ever get snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub id: String,
    pub peer_id: String,
    pub peer_name: String,
    /// Remote endpoint as "host:port".
    pub peer_address: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    /// Derived percentage in [0, 100]; `bytes_transferred` is the source
    /// of truth.
    pub progress: f32,
    /// Epoch millis.
    pub start_time: i64,
    /// Epoch millis; 0 until the transfer reaches a terminal state.
    pub end_time: i64,
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TransferStatus::Initializing.is_terminal());
        assert!(!TransferStatus::Waiting.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Canceled.is_terminal());
    }
}
