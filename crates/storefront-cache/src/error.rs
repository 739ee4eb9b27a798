use thiserror::Error;

/// An error produced while performing the underlying lookup for a cache miss.
///
/// The fetch executor classifies raw transport failures into this taxonomy.
/// Every caller attached to the same pending lookup observes the identical
/// outcome, which is why the type is `Clone`.
///
/// Only [`AuthRequired`](Self::AuthRequired) and [`Permanent`](Self::Permanent)
/// are meant to reach user-visible error states. [`Transient`](Self::Transient)
/// stays internal unless retries are exhausted, at which point it is
/// re-classified as `Permanent`. [`Cancelled`](Self::Cancelled) is not a
/// failure at all and must stay silent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// A network-level or timeout failure that is worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The session is no longer authenticated.
    ///
    /// Never retried and never cached, so callers can prompt
    /// re-authentication.
    #[error("authentication required")]
    AuthRequired,
    /// The lookup was cancelled before it settled.
    ///
    /// This is the outcome every attached caller observes after
    /// cancellation; it is not an error to surface.
    #[error("cancelled")]
    Cancelled,
    /// Any other terminal failure. Surfaced to the caller, not retried,
    /// not cached.
    #[error("{0}")]
    Permanent(String),
}

impl FetchError {
    /// Whether the executor may run another attempt for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Re-classifies a transient failure whose retry budget is spent.
    pub(crate) fn into_terminal(self) -> Self {
        match self {
            FetchError::Transient(msg) => {
                FetchError::Permanent(format!("retries exhausted: {msg}"))
            }
            other => other,
        }
    }

    /// Converts a foreign error into a [`Permanent`](Self::Permanent)
    /// failure, logging it at the call site.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Permanent(e.to_string())
    }
}

/// The outcome of one lookup, shared verbatim with every attached caller.
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_reclassification() {
        let err = FetchError::Transient("connection reset".into());
        assert!(err.is_retryable());
        assert_eq!(
            err.into_terminal(),
            FetchError::Permanent("retries exhausted: connection reset".into())
        );

        assert_eq!(FetchError::AuthRequired.into_terminal(), FetchError::AuthRequired);
        assert_eq!(FetchError::Cancelled.into_terminal(), FetchError::Cancelled);
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
