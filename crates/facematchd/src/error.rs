//! Error types and HTTP error responses for the face service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use facematch_core::ServiceError;
use serde::Serialize;

/// Request-level error type.
#[derive(Debug)]
pub enum ApiError {
    /// The face service rejected or failed the request.
    Service(ServiceError),
    /// The request body was rejected before reaching the service.
    Rejected(StatusCode, String),
    /// A requested temp file does not exist.
    NotFound,
}

/// JSON body returned on error.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, image_url) = match &self {
            ApiError::Service(e) if e.is_client_error() => (
                StatusCode::BAD_REQUEST,
                e.to_string(),
                e.image_url().map(str::to_owned),
            ),
            ApiError::Service(e) => {
                tracing::error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
            ApiError::Rejected(status, msg) => (*status, msg.clone(), None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string(), None),
        };

        let body = ErrorBody {
            error: message,
            code: status.as_u16(),
            image_url,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        ApiError::Rejected(e.status(), e.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::service::ImageSlot;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_is_400() {
        let resp = ApiError::from(ServiceError::Validation("Invalid mode. Use 'db' or 'upload'".into()))
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = body_json(resp).await;
        assert_eq!(json["error"], "Invalid mode. Use 'db' or 'upload'");
        assert_eq!(json["code"], 400);
        assert!(json.get("image_url").is_none());
    }

    #[tokio::test]
    async fn test_no_face_carries_image_url() {
        let resp = ApiError::from(ServiceError::NoFaceDetected {
            slot: ImageSlot::First,
            image_url: Some("/static/temp/abc.jpg".into()),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = body_json(resp).await;
        assert_eq!(json["error"], "No face found in first image");
        assert_eq!(json["image_url"], "/static/temp/abc.jpg");
    }

    #[tokio::test]
    async fn test_server_fault_hides_detail() {
        let resp = ApiError::from(ServiceError::Worker("task panicked at secret.rs".into()))
            .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(resp).await;
        assert_eq!(json["error"], "Internal server error");
        assert_eq!(json["code"], 500);
    }
}
