pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModelError {
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        ModelError::Parse(msg.into())
    }

    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        ModelError::Consistency(msg.into())
    }

    pub fn training<S: Into<String>>(msg: S) -> Self {
        ModelError::Training(msg.into())
    }

    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        ModelError::InvalidParameter(msg.into())
    }

    pub fn unknown_model_type<S: Into<String>>(tag: S) -> Self {
        ModelError::UnknownModelType(tag.into())
    }
}
