/// Errors surfaced by the collector library.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("admission lease error: {0}")]
    Lease(#[from] LeaseError),
    #[error("event stream error: {0}")]
    Stream(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("event channel closed")]
    ChannelClosed,
}

/// Failure to obtain an admission lease. Every variant except `Cancelled` means "try again later".
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("admission authority unreachable: {0}")]
    Unreachable(String),
    #[error("lease session failed: {0}")]
    Session(String),
    #[error("lease wait cancelled")]
    Cancelled,
}

impl LeaseError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LeaseError::Cancelled)
    }
}

impl From<kube::Error> for LeaseError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => LeaseError::Session(response.message),
            other => LeaseError::Unreachable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancellation_is_final() {
        assert!(LeaseError::Unreachable("socket missing".to_string()).is_retryable());
        assert!(LeaseError::Session("stream reset".to_string()).is_retryable());
        assert!(!LeaseError::Cancelled.is_retryable());
    }

    #[test]
    fn test_lease_error_wraps_into_collector_error() {
        let err: CollectorError = LeaseError::Session("denied".to_string()).into();
        assert!(err.to_string().contains("admission lease error"));
        assert!(err.to_string().contains("denied"));
    }
}
