//! Error taxonomy shared by the codec, both transports and the arm facade.

/// Everything that can go wrong between the host and the arm.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad sync, checksum or unexpected packet type.
    #[error("framing error: {0}")]
    Framing(String),
    /// No frame header, device reply or socket response within the bound.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Transport not connected, connect failed or send failed.
    #[error("connection error: {0}")]
    Connection(String),
    /// Socket payload that cannot be read as register values or a status.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device rejected a target, e.g. an IK position outside its workspace.
    #[error("device rejected target at register {address}: {reason}")]
    Range { address: u8, reason: String },
    /// Invalid transport selector or missing connection parameter.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A structural argument check failed before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
