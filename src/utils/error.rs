use thiserror::Error;

pub type Result<T> = std::result::Result<T, LanError>;

#[derive(Error, Debug)]
pub enum LanError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LanError {
    fn from(err: std::io::Error) -> Self {
        LanError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LanError {
    fn from(err: serde_json::Error) -> Self {
        LanError::Serialization(err.to_string())
    }
}
