use hubsim_util::crypto::InvalidKeyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    Closed,

    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        operation: &'static str,
        transport: &'static str,
    },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("hub replied with status {0}: {1}")]
    Status(u16, String),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("method invocation failed: {0}")]
    MethodFailed(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),

    #[error("invalid hub url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl TransportError {
    /// Returns true if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => !err.is_builder() && !err.is_decode(),
            Self::Status(code, _) => *code >= 500 || *code == 429,
            Self::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_classifies_server_errors_as_transient() {
        assert!(TransportError::Status(503, String::new()).is_transient());
        assert!(TransportError::Status(429, String::new()).is_transient());
        assert!(TransportError::Timeout.is_transient());

        assert!(!TransportError::Status(400, String::new()).is_transient());
        assert!(!TransportError::Unauthorized.is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(
            !TransportError::Unsupported {
                operation: "get_twin",
                transport: "http"
            }
            .is_transient()
        );
    }
}
