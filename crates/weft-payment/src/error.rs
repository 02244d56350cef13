use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use weft::private_api::ErrorBody;
use weft::WeftError;

/// Service-level error: the platform taxonomy plus database failures.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Core(#[from] WeftError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl PaymentError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        PaymentError::Core(WeftError::BadRequest(msg.into()))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PaymentError::Core(WeftError::Internal(msg.into()))
    }

    /// The taxonomy view of this error; database failures surface as
    /// `internal` without leaking statement detail.
    pub fn as_wire(&self) -> ErrorBody {
        match self {
            PaymentError::Core(e) => ErrorBody::from_error(e),
            PaymentError::Db(_) => ErrorBody {
                error: "internal".to_string(),
                message: "an internal error occurred".to_string(),
                detail: None,
                retry_after: None,
            },
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            PaymentError::Core(e) => e.status_code(),
            PaymentError::Db(_) => 500,
        }
    }
}

impl ResponseError for PaymentError {
    fn error_response(&self) -> HttpResponse {
        if let PaymentError::Db(e) = self {
            tracing::error!(error = %e, "database error");
        }
        let status = actix_web::http::StatusCode::from_u16(self.status())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
        HttpResponse::build(status).json(self.as_wire())
    }
}

/// SQLite extended code for UNIQUE constraint violations.
pub const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

/// Whether a rusqlite error is a UNIQUE constraint conflict.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == SQLITE_CONSTRAINT_UNIQUE
    )
}
