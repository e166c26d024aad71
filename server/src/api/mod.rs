//! HTTP admin surfaces
//!
//! Both daemons expose a small admin API. Every endpoint answers with the
//! same envelope: `{"status_code": ..., "status_txt": ..., "data": ...}`,
//! with the HTTP status mirroring `status_code`.

pub mod broker;
pub mod lookup;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

pub(crate) fn api_response<T: Serialize>(
    code: StatusCode,
    status_txt: &str,
    data: T,
) -> Response {
    (
        code,
        Json(json!({
            "status_code": code.as_u16(),
            "status_txt": status_txt,
            "data": data,
        })),
    )
        .into_response()
}

pub(crate) fn ok<T: Serialize>(data: T) -> Response {
    api_response(StatusCode::OK, "OK", data)
}

pub(crate) fn error(code: StatusCode, status_txt: &str) -> Response {
    api_response(code, status_txt, serde_json::Value::Null)
}
