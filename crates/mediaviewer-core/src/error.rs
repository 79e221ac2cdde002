use crate::client::ViewerError;
use crate::crypto::CryptoError;
use crate::event::EventError;

/// A request could not be built from the event
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Event(#[from] EventError),
}

impl BuildError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Crypto(e) => e.kind(),
            Self::Event(e) => e.kind(),
        }
    }
}

/// Why a media event did not produce a viewer link
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Local failure before anything was sent
    #[error("failed to build viewer request: {0}")]
    Build(#[from] BuildError),

    /// The viewer call failed or returned something unusable
    #[error("viewer request failed: {0}")]
    Upload(#[from] ViewerError),
}

impl ForwardError {
    /// Short stable name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(e) => e.kind(),
            Self::Upload(e) => e.kind(),
        }
    }

    /// Whether the viewer was contacted at all
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upload(_))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn kinds_pass_through() {
        let err = ForwardError::from(BuildError::from(CryptoError::InvalidBase64 {
            field: "file key",
        }));
        assert_eq!(err.kind(), "invalid_base64");
        assert!(!err.is_upstream());

        let err = ForwardError::from(ViewerError::Timeout(Duration::from_secs(3)));
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_upstream());
    }
}
