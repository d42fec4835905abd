use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::archive::DuplicateNotFound;
use crate::cache::CacheConflict;
use crate::job::JobNotFound;

pub type Result<T> = std::result::Result<T, AppError>;

/// API错误类型
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // 按已知错误类型映射状态码，其余一律 500
        let status = if self.0.downcast_ref::<JobNotFound>().is_some()
            || self.0.downcast_ref::<DuplicateNotFound>().is_some()
        {
            StatusCode::NOT_FOUND
        } else if self.0.downcast_ref::<CacheConflict>().is_some() {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, format!("Something went wrong: {}", self.0)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
