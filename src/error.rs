use std::path::PathBuf;

/// Failures surfaced by the authorization, mail and persistence layers.
#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    #[error("authorization exchange failed for account {account}: {message}")]
    AuthExchangeFailed { account: String, message: String },

    #[error("token refresh failed for account {account}: {message}")]
    TokenRefreshFailed { account: String, message: String },

    #[error("mail query failed: {0}")]
    MailQueryFailed(String),

    #[error("fetching message {id} failed: {message}")]
    MailFetchFailed { id: String, message: String },

    #[error("no credential available for account {account}: {reason}")]
    NoCredentialAvailable { account: String, reason: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: malformed credential file: {source}", path.display())]
    CredentialFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DcpError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DcpError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = DcpError> = std::result::Result<T, E>;
