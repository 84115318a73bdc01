use thiserror::Error;

/// Failures surfaced by the uplink pipeline.
#[derive(Error, Debug)]
pub enum UplinkError {
    /// Serial / AT layer unreachable or answered with something unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Carrier attach rejected or timed out.
    #[error("network error: {0}")]
    Network(String),

    #[error("not connected")]
    NotConnected,

    /// Broker-level rejection (bad topic, auth failure, ...).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failures of a single AT command exchange.
#[derive(Error, Debug)]
pub enum AtError {
    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for response to '{0}'")]
    Timeout(String),

    #[error("'{command}' rejected by modem: {detail}")]
    Rejected { command: String, detail: String },

    #[error("malformed response to '{command}': {line}")]
    Malformed { command: String, line: String },
}

impl From<AtError> for UplinkError {
    fn from(err: AtError) -> Self {
        UplinkError::Transport(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
