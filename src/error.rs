use std::fmt;

#[derive(Debug)]
pub enum RouterError {
    /// Bridge child crash, malformed child record, or transport-level HTTP failure.
    Transport(String),
    /// Malformed inbound event, missing field, bad chunk sequence, oversized chunk.
    Protocol(String),
    /// Port isolation rejection, unknown service, disabled service.
    Policy(String),
    UploadTimeout,
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Transport(msg) => write!(f, "transport error: {}", msg),
            RouterError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            RouterError::Policy(msg) => write!(f, "policy error: {}", msg),
            RouterError::UploadTimeout => write!(f, "upload timed out before chunks arrived"),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<reqwest::Error> for RouterError {
    fn from(e: reqwest::Error) -> Self {
        RouterError::Transport(e.to_string())
    }
}
