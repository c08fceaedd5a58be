/// History store error with retry classification
///
/// Stores return this error type to tell the runtime how to react.
///
/// # Error Classification
///
/// **Retryable**:
/// - Database busy/locked
/// - Connection timeouts
///
/// **Permanent**:
/// - Unknown instance
/// - Duplicate instance id
/// - Constraint violations
///
/// **Corruption**:
/// - Gap in sequence numbers
/// - Undecodable history record
///
/// Corruption is fatal for the affected instance: the runtime marks it failed
/// with [`crate::ErrorDetails::HistoryCorruption`] and never replays it again.
///
/// ```rust
/// use blobflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "database is locked");
/// assert!(busy.is_retryable());
///
/// let gap = ProviderError::corruption("read", "expected sequence 3, found 5");
/// assert!(gap.is_corruption());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "append", "read")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Retryable,
    Permanent,
    Corruption,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Retryable,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Permanent,
        }
    }

    /// Create an error reporting a broken history invariant
    pub fn corruption(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Corruption,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_corruption(&self) -> bool {
        self.kind == ProviderErrorKind::Corruption
    }

    /// Convert to the instance-level error detail.
    ///
    /// Only corruption has an instance-level meaning; other store errors are
    /// infrastructure trouble and are reported as transient.
    pub fn to_error_details(&self) -> crate::ErrorDetails {
        match self.kind {
            ProviderErrorKind::Corruption => crate::ErrorDetails::HistoryCorruption {
                message: self.to_string(),
            },
            _ => crate::ErrorDetails::TransientActivity {
                message: self.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// String errors are treated as retryable.
impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self::retryable("unknown", s)
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let retryable = ProviderError::retryable("append", "Database is busy");
        assert!(retryable.is_retryable());
        assert!(!retryable.is_corruption());
        assert_eq!(retryable.operation, "append");

        let permanent = ProviderError::permanent("create_instance", "instance already exists");
        assert!(!permanent.is_retryable());
        assert!(!permanent.is_corruption());

        let corrupt = ProviderError::corruption("read", "gap at 4");
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_retryable());

        let display = format!("{permanent}");
        assert!(display.contains("create_instance"));
        assert!(display.contains("already exists"));

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn test_provider_error_from_string() {
        let from_string: ProviderError = "Some error message".into();
        assert!(from_string.is_retryable());
        assert_eq!(from_string.operation, "unknown");
        assert_eq!(from_string.message, "Some error message");
    }

    #[test]
    fn test_corruption_maps_to_history_corruption() {
        match ProviderError::corruption("read", "gap").to_error_details() {
            crate::ErrorDetails::HistoryCorruption { message } => assert!(message.contains("gap")),
            other => panic!("expected HistoryCorruption, got {other:?}"),
        }
        assert!(ProviderError::retryable("read", "busy").to_error_details().is_retryable());
    }
}
