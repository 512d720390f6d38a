use thiserror::Error;

/// Failure categories a caller of the contact list can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ContactAlreadyExists,
    GroupAlreadyExists,
    NotSupported,
    Network,
    MoveContact,
    RemoveGroup,
    Unknown,
}

/// Error codes reported by protocol providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    SubscriptionAlreadyExists,
    NotSupportedOperation,
    NetworkFailure,
    IllegalArgument,
    General,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Contact already exists: {0}")]
    ContactAlreadyExists(String),

    #[error("Group already exists: {0}")]
    GroupAlreadyExists(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to move contact: {0}")]
    MoveContact(String),

    #[error("Failed to remove group: {0}")]
    RemoveGroup(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Provider operation failed ({code:?}): {message}")]
    OperationFailed {
        code: ProviderErrorCode,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn provider(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Error::OperationFailed {
            code,
            message: message.into(),
        }
    }

    /// Maps the error onto the caller-facing taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ContactAlreadyExists(_) => ErrorCode::ContactAlreadyExists,
            Error::GroupAlreadyExists(_) => ErrorCode::GroupAlreadyExists,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Network(_) => ErrorCode::Network,
            Error::MoveContact(_) => ErrorCode::MoveContact,
            Error::RemoveGroup(_) => ErrorCode::RemoveGroup,
            Error::OperationFailed { code, .. } => match code {
                ProviderErrorCode::SubscriptionAlreadyExists => ErrorCode::ContactAlreadyExists,
                ProviderErrorCode::NotSupportedOperation => ErrorCode::NotSupported,
                ProviderErrorCode::NetworkFailure => ErrorCode::Network,
                ProviderErrorCode::IllegalArgument | ProviderErrorCode::General => {
                    ErrorCode::Unknown
                }
            },
            Error::Unknown(_)
            | Error::InvalidArgument(_)
            | Error::Storage(_)
            | Error::Json(_)
            | Error::Io(_) => ErrorCode::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_codes_map_onto_taxonomy() {
        let err = Error::provider(ProviderErrorCode::SubscriptionAlreadyExists, "dup");
        assert_eq!(err.code(), ErrorCode::ContactAlreadyExists);

        let err = Error::provider(ProviderErrorCode::NotSupportedOperation, "no");
        assert_eq!(err.code(), ErrorCode::NotSupported);

        let err = Error::provider(ProviderErrorCode::General, "boom");
        assert_eq!(err.code(), ErrorCode::Unknown);
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::Network("no confirmation for alice@example.com".to_string());
        assert_eq!(
            err.to_string(),
            "Network error: no confirmation for alice@example.com"
        );
        assert_eq!(err.code(), ErrorCode::Network);
    }
}
