use crate::ProtocolError;
use xidgate::Error;

/// Frame tags, one byte each.
pub mod tag {
    // Control plane, client to authority.
    pub const BATCH_REQUEST: u8 = b'p';
    pub const SINGLE_REQUEST: u8 = b'g';
    pub const FINISH: u8 = b'f';
    // Control plane, authority to client.
    pub const BATCH_GRANT: u8 = b'q';
    pub const SINGLE_GRANT: u8 = b'a';
    pub const FINISH_ACK: u8 = b'c';
    pub const REJECT: u8 = b'e';
    // Both planes, both directions.
    pub const HEARTBEAT: u8 = b'h';

    // Broadcast, subscriber to server.
    pub const COMMAND: u8 = b'Q';
    pub const STOP: u8 = b'X';
    pub const POSITION: u8 = b'c';
    pub const KEEPALIVE: u8 = b'd';
    // Broadcast, server to subscriber.
    pub const ACCEPTED: u8 = b'k';
    pub const BOOTSTRAP: u8 = b's';
    pub const ASSIGN: u8 = b'a';
    pub const COMMIT: u8 = b'c';
}

/// One-byte error code carried by reject frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    UpstreamUnavailable = 1,
    Timeout = 2,
    CapacityExceeded = 3,
    ServiceShutdown = 4,
    Protocol = 5,
    Internal = 6,
}

impl ErrorCode {
    /// Rebuilds a core error on the receiving side. Detail that did not cross
    /// the wire is replaced with a fixed description.
    pub fn into_error(self) -> Error {
        match self {
            Self::UpstreamUnavailable => Error::upstream("authority reported upstream unavailable"),
            Self::Timeout => Error::Timeout,
            Self::CapacityExceeded => Error::CapacityExceeded { capacity: 0 },
            Self::ServiceShutdown => Error::ServiceShutdown,
            Self::Protocol => Error::Protocol {
                reason: "authority rejected the request as malformed".to_string(),
            },
            Self::Internal => Error::ChannelError {
                context: "authority internal error".to_string(),
            },
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::UpstreamUnavailable { .. } => Self::UpstreamUnavailable,
            Error::Timeout => Self::Timeout,
            Error::CapacityExceeded { .. } => Self::CapacityExceeded,
            Error::ServiceShutdown => Self::ServiceShutdown,
            Error::Protocol { .. } => Self::Protocol,
            Error::StaleCompletion { .. } | Error::ChannelError { .. } => Self::Internal,
        }
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            1 => Self::UpstreamUnavailable,
            2 => Self::Timeout,
            3 => Self::CapacityExceeded,
            4 => Self::ServiceShutdown,
            5 => Self::Protocol,
            6 => Self::Internal,
            other => return Err(ProtocolError::InvalidErrorCode(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_the_wire() {
        for err in [
            Error::upstream("down"),
            Error::Timeout,
            Error::ServiceShutdown,
        ] {
            let code = ErrorCode::from(&err);
            let back = ErrorCode::try_from(code as u8).unwrap().into_error();
            assert_eq!(
                core::mem::discriminant(&back),
                core::mem::discriminant(&err)
            );
        }
        assert!(matches!(
            ErrorCode::try_from(0),
            Err(ProtocolError::InvalidErrorCode(0))
        ));
    }
}
