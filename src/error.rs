use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Forbidden")]
    Forbidden,

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Invalid Range Header")]
    InvalidRange,

    #[error("Internal Server Error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::InvalidRange => (StatusCode::RANGE_NOT_SATISFIABLE, self.to_string()),
            AppError::Internal(_) | AppError::Io(_) | AppError::Http(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        (status, message).into_response()
    }
}

/// UPnP action fault, carried inside a SOAP Fault `<UPnPError>` detail.
#[derive(Error, Debug, Clone)]
#[error("UPnP error {code}: {description}")]
pub struct UpnpError {
    pub code: u32,
    pub description: String,
}

pub const INVALID_ACTION: u32 = 401;
pub const ACTION_FAILED: u32 = 501;
pub const ARGUMENT_VALUE_INVALID: u32 = 600;
pub const NO_SUCH_OBJECT: u32 = 701;

impl UpnpError {
    pub fn invalid_action() -> Self {
        Self {
            code: INVALID_ACTION,
            description: "Invalid Action".into(),
        }
    }

    pub fn invalid_args(description: impl Into<String>) -> Self {
        Self {
            code: ARGUMENT_VALUE_INVALID,
            description: description.into(),
        }
    }

    pub fn no_such_object(description: impl Into<String>) -> Self {
        Self {
            code: NO_SUCH_OBJECT,
            description: description.into(),
        }
    }

    pub fn action_failed(description: impl Into<String>) -> Self {
        Self {
            code: ACTION_FAILED,
            description: description.into(),
        }
    }
}
