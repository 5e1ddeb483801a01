//! Error types for the SecureGuard data plane

use thiserror::Error;

/// Main error type for SecureGuard
#[derive(Error, Debug)]
pub enum SecureGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Handshake errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Data path errors
    #[error("Data path error: {0}")]
    DataPath(#[from] DataPathError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration errors, surfaced synchronously to the configuration plane
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Peer limit of {max} exceeded")]
    PeerLimitExceeded { max: usize },

    #[error("Unknown peer: {key}")]
    UnknownPeer { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Handshake failures. Every variant results in a silent drop.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    InvalidMac,

    #[error("Authentication of handshake payload failed")]
    Decryption,

    #[error("Timestamp is not newer than the last one seen")]
    StaleTimestamp,

    #[error("Initiation flood from peer")]
    Flood,

    #[error("Handshake message not expected in state {state}")]
    UnexpectedState { state: &'static str },

    #[error("Unknown peer static key")]
    UnknownPeer,

    #[error("Unknown receiver index: {index}")]
    UnknownIndex { index: u32 },

    #[error("No local static identity configured")]
    NoIdentity,

    #[error("Diffie-Hellman produced a non-contributory shared secret")]
    WeakKey,

    #[error("Sealing a handshake payload failed: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for HandshakeError {
    fn from(_: CryptoError) -> Self {
        HandshakeError::Decryption
    }
}

/// Data path errors for transport packets
#[derive(Error, Debug)]
pub enum DataPathError {
    #[error("Session expired")]
    SessionExpired,

    #[error("No allowed-IP route for {addr}")]
    NoRoute { addr: String },

    #[error("Queue overflow")]
    QueueOverflow,

    #[error("Replay detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Malformed packet: {reason}")]
    Malformed { reason: &'static str },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("Device is down")]
    DeviceDown,

    #[error("Decryption failed")]
    Decryption,
}

impl From<CryptoError> for DataPathError {
    fn from(_: CryptoError) -> Self {
        DataPathError::Decryption
    }
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("No socket for address family of {addr}")]
    NoSocketForFamily { addr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

impl SecureGuardError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./secureguard"
                    .to_string();
                #[cfg(not(target_os = "linux"))]
                return "Insufficient privileges. Run with sudo.".to_string();
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Network(NetworkError::BindFailed { addr, .. }) => {
                format!(
                    "Could not bind UDP socket on {}.\n  \
                    Check that no other WireGuard instance uses this ListenPort.",
                    addr
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => false,
            Self::Tunnel(TunnelError::CreateFailed { .. }) => false,

            Self::Handshake(_) => true,
            Self::DataPath(_) => true,
            Self::Network(_) => true,
            Self::Crypto(CryptoError::Decryption) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => 2,
            Self::Network(_) => 3,
            Self::Handshake(_) | Self::DataPath(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for SecureGuard operations
pub type Result<T> = std::result::Result<T, SecureGuardError>;
