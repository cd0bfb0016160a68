use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::parse_bool;
use crate::dispatch::{RemovalFailure, RemovalOptions, RemovalResult};
use crate::providers::ProviderErrorKind;
use crate::quota::UsageReport;
use crate::storage::UsageHistoryRecord;

use super::types::{ErrorResponse, ProviderStatus, RoutingMode, StatusResponse};
use super::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

const ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];
const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

const REMOVAL_METHOD_HEADER: &str = "x-removal-method";
const API_REMAINING_HEADER: &str = "x-api-remaining";
const API_LIMIT_HEADER: &str = "x-api-limit";

struct UploadedImage {
    data: Bytes,
    content_type: Option<String>,
    file_name: Option<String>,
}

struct RemovalForm {
    image: Option<UploadedImage>,
    force_remote: bool,
    use_local: bool,
    mode: RoutingMode,
}

pub async fn remove_background(
    State(state): State<Arc<ApiState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;
    let upload = form
        .image
        .ok_or_else(|| bad_request("NO_FILE", "No image file provided"))?;
    validate_upload(&upload, state.config.max_file_size)?;

    info!(
        file_name = upload.file_name.as_deref().unwrap_or("-"),
        content_type = upload.content_type.as_deref().unwrap_or("-"),
        bytes = upload.data.len(),
        mode = ?form.mode,
        force_remote = form.force_remote,
        use_local = form.use_local,
        "background removal requested"
    );

    let dispatcher = &state.dispatcher;
    let result = match form.mode {
        RoutingMode::Paced => {
            dispatcher
                .remove_background_paced(upload.data, form.force_remote)
                .await
        }
        RoutingMode::LocalFirst => {
            let options = RemovalOptions {
                force_remote: form.force_remote,
                use_local: form.use_local,
            };
            dispatcher.remove_background(upload.data, options).await
        }
        RoutingMode::RemoteOnly => {
            let options = RemovalOptions {
                force_remote: form.force_remote,
                use_local: false,
            };
            dispatcher.remove_background(upload.data, options).await
        }
    };

    if result.success {
        Ok(image_response(result))
    } else {
        Err(failure_response(result))
    }
}

pub async fn get_usage(State(state): State<Arc<ApiState>>) -> ApiResult<UsageReport> {
    Ok(Json(state.dispatcher.usage_stats()))
}

pub async fn usage_history(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Vec<UsageHistoryRecord>> {
    let history = state
        .dispatcher
        .quota()
        .history()
        .map_err(internal_error)?;
    Ok(Json(history))
}

pub async fn service_status(State(state): State<Arc<ApiState>>) -> ApiResult<StatusResponse> {
    let availability = |configured: bool| {
        if configured {
            "available".to_string()
        } else {
            "unconfigured".to_string()
        }
    };

    Ok(Json(StatusResponse {
        status: "operational".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        services: ProviderStatus {
            local: availability(state.config.local_command.is_some()),
            remote: availability(state.config.remote_api_key.is_some()),
        },
        usage: state.dispatcher.usage_stats(),
    }))
}

pub async fn health_check() -> ApiResult<serde_json::Value> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "removal-service"
    })))
}

async fn read_form(mut multipart: Multipart) -> Result<RemovalForm, ApiError> {
    let mut form = RemovalForm {
        image: None,
        force_remote: false,
        use_local: true,
        mode: RoutingMode::default(),
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?;
                form.image = Some(UploadedImage {
                    data,
                    content_type,
                    file_name,
                });
            }
            "force_remote" | "forceRemote" => {
                form.force_remote = flag(&name, &field.text().await.map_err(multipart_error)?)?;
            }
            "use_local" | "useLocal" => {
                form.use_local = flag(&name, &field.text().await.map_err(multipart_error)?)?;
            }
            "mode" => {
                let value = field.text().await.map_err(multipart_error)?;
                form.mode = value
                    .parse()
                    .map_err(|err: String| bad_request("INVALID_MODE", &err))?;
            }
            _ => {}
        }
    }

    Ok(form)
}

fn flag(name: &str, value: &str) -> Result<bool, ApiError> {
    parse_bool(value).map_err(|_| {
        bad_request(
            "INVALID_FLAG",
            &format!("{name} must be a boolean, got {value:?}"),
        )
    })
}

fn validate_upload(upload: &UploadedImage, max_file_size: usize) -> Result<(), ApiError> {
    if !is_supported_image(upload.content_type.as_deref(), upload.file_name.as_deref()) {
        return Err(bad_request(
            "INVALID_FILE_TYPE",
            "Invalid file type. Only JPEG, PNG, and WEBP images are allowed.",
        ));
    }
    if upload.data.len() > max_file_size {
        return Err(file_too_large(max_file_size));
    }
    if upload.data.is_empty() {
        return Err(bad_request("EMPTY_FILE", "Uploaded image is empty"));
    }
    Ok(())
}

fn is_supported_image(content_type: Option<&str>, file_name: Option<&str>) -> bool {
    match content_type {
        Some(ct) if ALLOWED_MIME_TYPES.contains(&ct) => true,
        Some(ct) if ct != "application/octet-stream" => false,
        _ => file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false),
    }
}

fn image_response(result: RemovalResult) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"processed-image.png\""),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

    if let Some(method) = result.method {
        headers.insert(
            HeaderName::from_static(REMOVAL_METHOD_HEADER),
            HeaderValue::from_static(method.as_str()),
        );
    }
    if let Some(usage) = result.api_usage {
        headers.insert(
            HeaderName::from_static(API_REMAINING_HEADER),
            HeaderValue::from(usage.remaining),
        );
        headers.insert(
            HeaderName::from_static(API_LIMIT_HEADER),
            HeaderValue::from(usage.total),
        );
    }

    let body = result.processed_image.unwrap_or_default();
    (StatusCode::OK, headers, body).into_response()
}

fn failure_response(result: RemovalResult) -> ApiError {
    let (status, code) = match &result.failure {
        Some(RemovalFailure::QuotaExhausted { .. }) => {
            (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXHAUSTED")
        }
        Some(failure) => match failure.remote_kind() {
            Some(ProviderErrorKind::Auth) => (StatusCode::UNAUTHORIZED, "API_ERROR"),
            Some(ProviderErrorKind::RateLimit) | Some(ProviderErrorKind::Quota) => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT")
            }
            Some(ProviderErrorKind::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_ERROR"),
        },
        None => (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_ERROR"),
    };

    let message = result
        .error
        .clone()
        .unwrap_or_else(|| "Failed to process image".to_string());
    warn!(code, error = %message, "background removal failed");

    (
        status,
        Json(ErrorResponse {
            error: message,
            code: code.to_string(),
            details: Some(serde_json::json!({
                "method": result.method,
                "failure": result.failure,
            })),
        }),
    )
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ErrorResponse {
                error: "File too large.".to_string(),
                code: "FILE_TOO_LARGE".to_string(),
                details: None,
            }),
        );
    }
    bad_request("INVALID_MULTIPART", &err.body_text())
}

fn file_too_large(max_file_size: usize) -> ApiError {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(ErrorResponse {
            error: format!(
                "File too large. Maximum size is {}MB.",
                max_file_size / (1024 * 1024)
            ),
            code: "FILE_TOO_LARGE".to_string(),
            details: Some(serde_json::json!({ "max_bytes": max_file_size })),
        }),
    )
}

fn bad_request(code: &str, message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
            details: None,
        }),
    )
}

fn internal_error<E: std::fmt::Display>(err: E) -> ApiError {
    error!(error = %err, "removal API internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
            code: "INTERNAL_ERROR".to_string(),
            details: Some(serde_json::json!({ "message": err.to_string() })),
        }),
    )
}
