/// Errors reported by the Pylontech frame codec, payload decoders and sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or misplaced `~`/`\r` armor, or characters that are not hex digits.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    /// The frame checksum does not match the transmitted one.
    #[error("Checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The check nibble of the length field does not match its length bits.
    #[error("Invalid length field {0:04X}")]
    InvalidLengthField(u16),
    /// The info payload length disagrees with the declared or consumed length.
    #[error("Payload length mismatch - expected={expected} actual={actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },
    /// Fewer bytes remain than the next fixed-width field requires.
    #[error("Truncated payload - needed={needed} remaining={remaining}")]
    TruncatedPayload { needed: usize, remaining: usize },
    /// No response was received within the read deadline.
    #[error("No response within timeout")]
    ChannelTimeout,
    /// A value does not fit into its wire representation.
    #[error("Value out of range")]
    RangeError,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
