use shared::{
    domain::{ConversationId, LocalId},
    error::ApiException,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no active user session")]
    NotAuthenticated,
    #[error("no credential available to connect")]
    MissingCredential,
    #[error("sync pull for conversation {conversation_id} failed: {source}")]
    SyncPullFailed {
        conversation_id: ConversationId,
        #[source]
        source: anyhow::Error,
    },
    #[error("submission {local_id} failed: {source}")]
    SubmissionFailed {
        local_id: LocalId,
        #[source]
        source: anyhow::Error,
    },
    #[error("message {0} is not a failed submission")]
    NotRetryable(LocalId),
    #[error("local cache error: {0}")]
    Cache(#[source] anyhow::Error),
    #[error("request failed: {0}")]
    Request(#[source] anyhow::Error),
    #[error("client driver stopped")]
    DriverStopped,
}

impl ClientError {
    /// The server-side error carried by a request or submission failure.
    pub fn api_exception(&self) -> Option<&ApiException> {
        match self {
            Self::Request(source)
            | Self::SubmissionFailed { source, .. }
            | Self::SyncPullFailed { source, .. } => source.downcast_ref::<ApiException>(),
            _ => None,
        }
    }

    /// True when the session itself is the problem, either missing locally
    /// or refused by the server.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::NotAuthenticated)
            || self
                .api_exception()
                .is_some_and(ApiException::is_unauthorized)
    }
}
