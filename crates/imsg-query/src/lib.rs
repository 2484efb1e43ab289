pub mod directory;
pub mod facade;
pub mod resolver;
pub mod timeline;

use imsg_storage::StorageError;
use thiserror::Error;

pub use directory::ConversationDirectory;
pub use facade::{
    ChatDbSource, ConversationList, ListArgs, MessageHistory, QueryFacade, ReadArgs,
    RecentArgs, RecentMessages, SearchArgs, SearchResults, StoreLease, StoreSource,
};
pub use resolver::{IdentifierResolver, ResolvedTarget, TargetKind};
pub use timeline::{MessageTimeline, TimelineScope};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("contact not found: {0}")]
    ContactNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Store(#[from] StorageError),
    #[error("response encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    StoreAccessFailure,
    Internal,
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::ConversationNotFound(_) | QueryError::ContactNotFound(_) => {
                ErrorKind::NotFound
            }
            QueryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            QueryError::Store(_) => ErrorKind::StoreAccessFailure,
            QueryError::Encode(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidArgument(message.into())
    }
}
