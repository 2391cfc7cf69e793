use std::fmt;

/// Reason a frame failed to decode or was rejected by the protocol state machine.
///
/// Kept as a tagged enum (rather than folded into a string) so callers can match on
/// the exact wire-level violation instead of parsing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorReason {
    /// `magic != command ^ 0xffff_ffff`.
    BadMagic,
    /// The 32-bit command word is not one of the known ADB commands.
    UnknownCommand(u32),
    /// `data_len` exceeded the negotiated `max_data`.
    OversizePayload,
    /// The payload checksum did not match the header's `data_checksum`.
    ChecksumMismatch,
    /// A frame arrived that is not valid in the current handshake/multiplexer state.
    UnexpectedCommandInState,
}

impl fmt::Display for ProtocolErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad magic"),
            Self::UnknownCommand(cmd) => write!(f, "unknown command 0x{cmd:08x}"),
            Self::OversizePayload => write!(f, "payload exceeds negotiated max_data"),
            Self::ChecksumMismatch => write!(f, "payload checksum mismatch"),
            Self::UnexpectedCommandInState => write!(f, "unexpected command for current state"),
        }
    }
}

/// Error type for every fallible operation in this crate.
///
/// Every variant is a tagged kind per the protocol's error taxonomy; nothing here is
/// matched by inspecting a `Display` string.
#[derive(thiserror::Error, Debug)]
pub enum AdbError {
    /// The underlying transport is gone. Fatal to the connection.
    #[error("transport closed")]
    TransportClosed,

    /// A wire-level invariant was violated. Fatal; the connection is torn down.
    #[error("protocol error: {0}")]
    ProtocolError(ProtocolErrorReason),

    /// The daemon re-issued AUTH(TOKEN) after we sent our RSA public key: the user
    /// did not accept the key (or the device requires pairing and we never paired).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Distinguishes an unknown-key daemon from a user-denied one. Raised by callers
    /// applying policy on top of `AuthenticationFailed`, not inferred by the core.
    #[error("pairing required")]
    PairingRequired,

    /// The device rejected our pairing code.
    #[error("pairing rejected")]
    PairingRejected,

    /// The pairing transport closed mid-exchange.
    #[error("pairing aborted")]
    PairingAborted,

    /// The remote answered our OPEN with CLSE.
    #[error("connection refused by remote")]
    ConnectionRefused,

    /// The stream is closed (locally, or by the peer and fully drained).
    #[error("stream closed")]
    StreamClosed,

    /// A caller-supplied deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A caller-initiated cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Lower-level transport I/O failure that isn't the deliberate "peer hung up"
    /// signal (that's `TransportClosed`).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RSA / SPAKE2 / AEAD failure. Message is sanitized of key material by the caller.
    #[error("cryptography error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, AdbError>;
