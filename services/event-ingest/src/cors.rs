//! CORSヘッダー
//!
//! ブラウザからのクロスオリジン送信を許可するための固定ヘッダーを提供する。
//! - プリフライト（OPTIONS）: 204 No Content と許可ヘッダー一式
//! - 未対応メソッド: 404 Not Found
//! - JSONレスポンス: `Access-Control-Allow-Origin: *` のみ付与

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// 許可するオリジン
pub const ALLOW_ORIGIN: &str = "*";

/// プリフライトで許可するメソッド
pub const ALLOW_METHODS: &str = "GET, POST, OPTIONS, PUT, DELETE";

/// 404レスポンスのContent-Type
pub const NOT_FOUND_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

/// 404レスポンスで通知するメソッド
pub const NOT_FOUND_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE";

/// プリフライトで許可するリクエストヘッダー
pub const ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// 資格情報（Cookie/Authorization）の送信許可
pub const ALLOW_CREDENTIALS: &str = "true";

/// プリフライトリクエストへの応答
///
/// ボディなし、204 No Content。
pub fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static(ALLOW_CREDENTIALS),
    );
    response
}

/// 未対応メソッドへの応答（404 Not Found、テキストボディ）
pub fn not_found() -> Response {
    let mut response = Response::new(Body::from("Not Found"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(NOT_FOUND_CONTENT_TYPE),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(NOT_FOUND_ALLOW_METHODS),
    );
    response
}

/// レスポンスに `Access-Control-Allow-Origin: *` を付与する
pub fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    response
}
