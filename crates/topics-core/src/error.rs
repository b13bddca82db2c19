use std::fmt;

/// Boxed collaborator error, kept intact so callers can downcast it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
pub enum TopicsError {
    /// A caller broke a precondition: wrong-sized top topics, bad config values.
    InvalidArgument(String),
    /// The storage port failed. The original error is carried unchanged.
    Storage(BoxError),
    /// The classifier failed. The original error is carried unchanged.
    Classifier(BoxError),
    /// Configuration could not be read.
    Config(String),
}

impl TopicsError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TopicsError::InvalidArgument(msg.into())
    }

    pub fn storage(e: impl Into<BoxError>) -> Self {
        TopicsError::Storage(e.into())
    }

    pub fn classifier(e: impl Into<BoxError>) -> Self {
        TopicsError::Classifier(e.into())
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TopicsError::InvalidArgument(_))
    }
}

impl fmt::Display for TopicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicsError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            TopicsError::Storage(e) => write!(f, "storage error: {e}"),
            TopicsError::Classifier(e) => write!(f, "classifier error: {e}"),
            TopicsError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for TopicsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TopicsError::Storage(e) | TopicsError::Classifier(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TopicsError>;
