//! Protocol-level failures.
//!
//! Every variant is fatal to the connection that produced it and to nothing
//! else. Converting into [`xidgate::Error`] yields
//! [`xidgate::Error::Protocol`].

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame tag that is not valid in this direction.
    #[error("Unknown frame tag {tag:?}")]
    UnknownTag { tag: char },

    /// A frame header announced a body over the limit.
    #[error("Frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame body ended before all of its fields were read.
    #[error("Frame {tag:?} is truncated")]
    Truncated { tag: char },

    /// A frame body had bytes left over after its last field.
    #[error("Frame {tag:?} has {extra} trailing bytes")]
    TrailingBytes { tag: char, extra: usize },

    /// A well-formed frame arrived in a state that does not accept it.
    #[error("Unexpected frame: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    /// The stream-start handshake carried the wrong command.
    #[error("Unrecognized command {0:?}")]
    BadCommand(String),

    #[error("Command text is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unknown error code {0}")]
    InvalidErrorCode(u8),

    /// The peer closed the stream mid-conversation.
    #[error("Connection closed by peer")]
    ConnectionClosed,
}

impl From<ProtocolError> for xidgate::Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol {
            reason: err.to_string(),
        }
    }
}
