use thiserror::Error;

/// Errors surfaced by every mesh dev-space operation.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("validation: {0}")]
    Validation(String),
    /// Optimistic-concurrency rejection; the write may be retried after a re-read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("kube: {0}")]
    Kube(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MeshError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound(_))
    }

    /// Prefix the message with what was being attempted.
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            MeshError::Validation(m) => MeshError::Validation(format!("{}: {}", what, m)),
            MeshError::Conflict(m) => MeshError::Conflict(format!("{}: {}", what, m)),
            MeshError::NotFound(m) => MeshError::NotFound(format!("{}: {}", what, m)),
            MeshError::Kube(m) => MeshError::Kube(format!("{}: {}", what, m)),
            MeshError::Decode(m) => MeshError::Decode(format!("{}: {}", what, m)),
            MeshError::Internal(m) => MeshError::Internal(format!("{}: {}", what, m)),
        }
    }
}

impl From<anyhow::Error> for MeshError {
    fn from(e: anyhow::Error) -> Self {
        MeshError::Internal(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_variant() {
        let e = MeshError::Conflict("rv 3".into()).context("apply VirtualService/reviews");
        assert!(e.is_conflict());
        assert_eq!(e.to_string(), "conflict: apply VirtualService/reviews: rv 3");
    }
}
