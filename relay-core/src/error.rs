//! Errors callers need to tell apart. Everything else travels as a plain
//! `anyhow::Error` with context attached at the failing stage.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A worker observed the cancellation signal.
    #[error("canceled")]
    Canceled,

    /// The input ran out of packets.
    #[error("end of stream")]
    EndOfStream,

    #[error("audio transcoding is not supported, requested codec {0:?} (only \"copy\")")]
    AudioTranscodingUnsupported(String),

    #[error(
        "changing the video codec on the fly is not supported: encoder is {current:?}, requested {requested:?}"
    )]
    CodecChangeUnsupported { current: String, requested: String },

    #[error("processor {0:?} cannot be used as a packet source")]
    NotAPacketSource(String),

    #[error("no resources configured at fallback priority {0}")]
    NoSuchPriority(u32),

    #[error("no input tier could be opened")]
    NoInputAvailable,

    #[error("exactly one output is required, got {0}")]
    OutputCount(usize),
}

/// Cancellation and end-of-stream end a run without it being a failure.
pub fn is_clean_shutdown(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::Canceled) | Some(RelayError::EndOfStream)
    )
}
