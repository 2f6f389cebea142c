use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Session error: {message}")]
    Session { message: String },
}

impl AttendcamError {
    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }
}

/// Camera acquisition and capture failures. Fatal to the attempted session;
/// reported once and never retried automatically.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("Camera permission denied: {details}")]
    PermissionDenied { details: String },

    #[error("Camera device unavailable: {details}")]
    Unavailable { details: String },

    #[error("Frame capture failed: {details}")]
    Capture { details: String },
}

/// Transport-level failures. Retried internally with bounded backoff before
/// being escalated as fatal.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {details}")]
    Connect { url: String, details: String },

    #[error("Send failed: {details}")]
    Send { details: String },

    #[error("Connection lost after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Malformed or unrecognized inbound traffic. Logged and ignored; never
/// affects session continuation.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Malformed inbound message: {details}")]
    Malformed { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum ProcessingError {
    #[error("JPEG encoding failed: {details}")]
    JpegEncoding { details: String },
}

pub type Result<T> = std::result::Result<T, AttendcamError>;
