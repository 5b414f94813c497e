//! Error types for remote node calls.

/// Stable text the node uses for the space-limit condition.
pub const SPACE_LIMIT_EXCEEDED: &str = "space limit exceeded";

/// Errors returned by a [`RemoteNode`](crate::RemoteNode).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The account has no room for the request.
    #[error("space limit exceeded")]
    SpaceLimitExceeded,

    /// The file is not known to the node.
    #[error("file not found")]
    FileNotFound,

    /// The node could not be reached.
    #[error("node unavailable")]
    Unavailable,

    /// Any other RPC failure.
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl RemoteError {
    /// Whether this is the space-limit condition, including opaque RPC
    /// errors carrying the node's sentinel text.
    pub fn is_space_limit_exceeded(&self) -> bool {
        match self {
            Self::SpaceLimitExceeded => true,
            Self::Rpc(msg) => msg.contains(SPACE_LIMIT_EXCEEDED),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_limit_detection() {
        assert!(RemoteError::SpaceLimitExceeded.is_space_limit_exceeded());
        assert!(RemoteError::Rpc("push: space limit exceeded (code 5)".into()).is_space_limit_exceeded());
        assert!(!RemoteError::Rpc("timeout".into()).is_space_limit_exceeded());
        assert!(!RemoteError::Unavailable.is_space_limit_exceeded());
    }
}
