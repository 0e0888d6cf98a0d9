use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing value for argument: {flag}")]
    MissingValue { flag: String },
    #[error("missing required argument: {field}")]
    MissingRequired { field: String },
    #[error("invalid value for {flag}={value}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("unsupported argument: {arg}")]
    UnsupportedArgument { arg: String },
    #[error("config error: {message}")]
    Config { message: String },
    #[error("parse error: {message}")]
    ParseError { message: String },
    #[error("alignment file error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),
    #[error("resource error: {message}")]
    Resource { message: String },
    #[error("invariant violation: {message}")]
    Internal { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        AppError::Config {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        AppError::ParseError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            message: message.into(),
        }
    }
}
