/// Reasons a complete frame produced no telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The frame is shorter than its header, or than the counts in its header require.
    #[error("truncated frame ({len} bytes, need {needed})")]
    TruncatedFrame { needed: usize, len: usize },

    /// The frame carries a function code other than the status code.
    #[error("unsupported function code 0x{0:02x}")]
    UnsupportedFunctionCode(u8),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
