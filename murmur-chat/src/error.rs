//! Error kinds shared by the server and client halves.

use std::time::Duration;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

#[derive(Error, Debug)]
pub enum ChatError {
    /// The client could not reach `host:port`.
    #[error("No chatroom found at {addr}: {source}")]
    ConnectionUnavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Admission refused because every slot is occupied.
    #[error("Server is full")]
    CapacityExceeded,
    /// The shutdown sentinel was observed.
    #[error("Server is offline")]
    ServerOffline,
    /// Read/write fault on an established connection.
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    #[error("Message id {id} out of range (log size {size})")]
    OutOfRange { id: usize, size: usize },
    #[error("Peer did not respond within {0:?}")]
    Timeout(Duration),
    /// Fault on the listening socket; fatal to the server.
    #[error("Listener error: {0}")]
    Listener(#[source] std::io::Error),
    #[error("Connection cancelled")]
    Cancelled,
}

impl ChatError {
    pub(crate) fn closed_by_peer() -> Self {
        Self::TransportFailure("connection closed by peer".to_string())
    }

    /// Whether this error ends only the connection it occurred on.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure(_) | Self::Timeout(_) | Self::Cancelled
        )
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        Self::TransportFailure(e.to_string())
    }
}

impl From<LinesCodecError> for ChatError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                Self::TransportFailure("line length limit exceeded".to_string())
            }
            LinesCodecError::Io(io) => io.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_becomes_transport_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: ChatError = io.into();
        assert!(matches!(err, ChatError::TransportFailure(ref m) if m.contains("pipe gone")));
        assert!(err.is_connection_local());
    }

    #[test]
    fn test_line_length_error_is_transport_failure() {
        let err: ChatError = LinesCodecError::MaxLineLengthExceeded.into();
        assert!(matches!(err, ChatError::TransportFailure(_)));
    }

    #[test]
    fn test_admission_errors_are_not_connection_local() {
        assert!(!ChatError::CapacityExceeded.is_connection_local());
        assert!(!ChatError::ServerOffline.is_connection_local());
        assert!(!ChatError::OutOfRange { id: 3, size: 1 }.is_connection_local());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ChatError::CapacityExceeded.to_string(), "Server is full");
        assert_eq!(
            ChatError::OutOfRange { id: 7, size: 2 }.to_string(),
            "Message id 7 out of range (log size 2)"
        );
    }
}
