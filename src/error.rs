// src/error.rs - API error taxonomy
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    InternalServerError(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
    AuthError(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

// The frontend surfaces `detail` from every rejected request.
#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "{}", msg),
            ApiError::NotFound(msg) => write!(f, "{}", msg),
            ApiError::Unauthorized(msg) => write!(f, "{}", msg),
            ApiError::Forbidden(msg) => write!(f, "{}", msg),
            ApiError::InternalServerError(msg) => write!(f, "{}", msg),
            ApiError::ValidationError(msg) => write!(f, "{}", msg),
            ApiError::DatabaseError(err) => write!(f, "Database error: {}", err),
            ApiError::AuthError(msg) => write!(f, "{}", msg),
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let error_response = ErrorResponse {
            detail: self.to_string(),
        };

        match self {
            ApiError::BadRequest(_) => HttpResponse::BadRequest().json(error_response),
            ApiError::NotFound(_) => HttpResponse::NotFound().json(error_response),
            ApiError::Unauthorized(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::Forbidden(_) => HttpResponse::Forbidden().json(error_response),
            ApiError::ValidationError(_) => HttpResponse::UnprocessableEntity().json(error_response),
            ApiError::DatabaseError(_) => HttpResponse::InternalServerError().json(error_response),
            ApiError::AuthError(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::InternalServerError(_) => HttpResponse::InternalServerError().json(error_response),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}

impl ApiError {
    pub fn unit_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Inventory unit '{}' not found", id))
    }

    pub fn request_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Blood request '{}' not found", id))
    }

    pub fn insufficient_stock(available: i64, requested: i64) -> Self {
        ApiError::BadRequest(format!(
            "Insufficient stock to approve. Available: {}, Requested: {}",
            available, requested
        ))
    }

    pub fn invalid_blood_group(value: &str) -> Self {
        ApiError::ValidationError(format!("Invalid blood group '{}'", value))
    }

    pub fn invalid_transition(from: &str, action: &str) -> Self {
        ApiError::BadRequest(format!("Request is '{}' and cannot be {}", from, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).error_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::unit_not_found("u1").error_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::AuthError("x".into()).error_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::ValidationError("x".into()).error_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_detail_messages() {
        let err = ApiError::insufficient_stock(2, 5);
        assert_eq!(
            err.to_string(),
            "Insufficient stock to approve. Available: 2, Requested: 5"
        );

        let err = ApiError::invalid_transition("Dispatched", "dispatched again");
        assert!(err.to_string().contains("Dispatched"));
    }
}
