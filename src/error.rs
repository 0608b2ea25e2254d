use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::Request;
use serde::Serialize;

/// The error taxonomy of the hub. Every service method returns `Result<T, HubError>`;
/// route adapters turn these into status codes via the `Responder` impl below.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    InvalidSignature(String),
    #[error("{0}")]
    InvalidTimestamp(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl HubError {
    pub fn not_found(what: impl Into<String>) -> Self {
        HubError::NotFound(what.into())
    }

    fn code(&self) -> &'static str {
        match self {
            HubError::Validation(_) => "VALIDATION_ERROR",
            HubError::InvalidSignature(_) => "INVALID_SIGNATURE",
            HubError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            HubError::Unauthorized(_) => "UNAUTHORIZED",
            HubError::Forbidden(_) => "FORBIDDEN",
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::Conflict(_) => "CONFLICT",
            HubError::PolicyDenied(_) => "POLICY_DENIED",
            HubError::Storage(_) => "STORAGE_ERROR",
        }
    }

    fn status(&self) -> Status {
        match self {
            HubError::Validation(_) => Status::BadRequest,
            HubError::InvalidSignature(_) => Status::Forbidden,
            HubError::InvalidTimestamp(_) => Status::BadRequest,
            HubError::Unauthorized(_) => Status::Unauthorized,
            HubError::Forbidden(_) => Status::Forbidden,
            HubError::NotFound(_) => Status::NotFound,
            HubError::Conflict(_) => Status::Conflict,
            HubError::PolicyDenied(_) => Status::Forbidden,
            HubError::Storage(_) => Status::InternalServerError,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for HubError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let body = Json(ErrorBody {
            error: self.to_string(),
            code: self.code(),
        });
        Response::build_from(body.respond_to(req)?)
            .status(self.status())
            .ok()
    }
}

pub type HubResult<T> = Result<T, HubError>;
