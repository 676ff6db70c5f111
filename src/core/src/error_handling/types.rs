use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    BadPortsRange(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
    MissingValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::MissingValue(e) => write!(f, "Missing value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum RecorderError {
    IoError(std::io::Error),
    SessionNotStarted(Uuid),
    SerializationFailed(String),
    QueueFull,
    StoreUnavailable(String),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::IoError(e) => write!(f, "Recorder IO error: {}", e),
            RecorderError::SessionNotStarted(id) => {
                write!(f, "Recorder has no open bracket for session {}", id)
            }
            RecorderError::SerializationFailed(e) => write!(f, "Serialization failed: {}", e),
            RecorderError::QueueFull => write!(f, "Recorder queue is full"),
            RecorderError::StoreUnavailable(e) => write!(f, "Command store unavailable: {}", e),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::IoError(err)
    }
}

#[derive(Debug)]
pub enum SessionError {
    AlreadyBridged,
    Closed,
    AlreadyAttached,
    NotFound,
    SessionLimitReached,
    BackendUnavailable(String),
    RecorderError(RecorderError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyBridged => write!(f, "Session is already bridged"),
            SessionError::Closed => write!(f, "Session is closed"),
            SessionError::AlreadyAttached => {
                write!(f, "Channel is already attached to the session")
            }
            SessionError::NotFound => write!(f, "Session not found"),
            SessionError::SessionLimitReached => write!(f, "Session limit reached"),
            SessionError::BackendUnavailable(e) => write!(f, "Backend unavailable: {}", e),
            SessionError::RecorderError(e) => write!(f, "Recorder error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RecorderError> for SessionError {
    fn from(err: RecorderError) -> Self {
        SessionError::RecorderError(err)
    }
}

#[derive(Debug)]
pub enum NetworkError {
    BindError(std::io::Error),
    AcceptError(std::io::Error),
    HandshakeFailed(String),
    NegotiationTimeout,
    ConnectionClosed,
    HostKeyError(std::io::Error),
    ConnectFailed(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindError(e) => write!(f, "Network bind error: {}", e),
            NetworkError::AcceptError(e) => write!(f, "Accept error: {}", e),
            NetworkError::HandshakeFailed(e) => write!(f, "Handshake failed: {}", e),
            NetworkError::NegotiationTimeout => write!(f, "Capability negotiation timed out"),
            NetworkError::ConnectionClosed => write!(f, "Connection closed by peer"),
            NetworkError::HostKeyError(e) => write!(f, "Host key error: {}", e),
            NetworkError::ConnectFailed(e) => write!(f, "Backend connection failed: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {}

#[derive(Debug, PartialEq)]
pub enum ResolveError {
    UnknownUser(String),
    UnknownAsset(String),
    PermissionDenied { user: String, asset: String },
    InvalidToken,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UnknownUser(u) => write!(f, "Unknown user: {}", u),
            ResolveError::UnknownAsset(a) => write!(f, "No asset matches: {}", a),
            ResolveError::PermissionDenied { user, asset } => {
                write!(f, "User {} may not connect to {}", user, asset)
            }
            ResolveError::InvalidToken => write!(f, "Invalid or expired token"),
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
    BadMessage(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "Web server bind failed: {}", e),
            WebError::BadMessage(e) => write!(f, "Malformed signaling message: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    NetworkError(NetworkError),
    SessionError(SessionError),
    RecorderError(RecorderError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::NetworkError(e) => write!(f, "Network error: {}", e),
            ControllerError::SessionError(e) => write!(f, "Session error: {}", e),
            ControllerError::RecorderError(e) => write!(f, "Recorder error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<NetworkError> for ControllerError {
    fn from(err: NetworkError) -> Self {
        ControllerError::NetworkError(err)
    }
}

impl From<RecorderError> for ControllerError {
    fn from(err: RecorderError) -> Self {
        ControllerError::RecorderError(err)
    }
}
