//! イベント取り込みのエラーハンドリング
//!
//! 呼び出し元へ返すエラーレスポンスは2種類のみ:
//! - 入力不正: 400 `{"error":"Invalid data structure"}`
//! - それ以外の失敗: 500 `{"status":"error","message":"Failed to insert event"}`
//!
//! 内部エラーの詳細はログにのみ出力し、レスポンスボディには含めない。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::cors;
use crate::store::StoreError;

/// 入力不正時のエラーメッセージ
pub const INVALID_DATA_MESSAGE: &str = "Invalid data structure";

/// 挿入失敗時のエラーメッセージ
pub const INSERT_FAILED_MESSAGE: &str = "Failed to insert event";

/// 挿入成功時のメッセージ
pub const INSERTED_MESSAGE: &str = "Event inserted";

/// 入力不正（400）のレスポンスボディ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

/// 処理結果（200 / 500）のレスポンスボディ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusBody {
    /// "success" または "error"
    pub status: String,
    pub message: String,
}

impl StatusBody {
    /// 挿入成功のボディ
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: INSERTED_MESSAGE.to_string(),
        }
    }

    /// 挿入失敗のボディ
    pub fn failure() -> Self {
        Self {
            status: "error".to_string(),
            message: INSERT_FAILED_MESSAGE.to_string(),
        }
    }
}

/// イベント取り込みエラー
///
/// `InvalidPayload` のみが400となり、それ以外はすべて500に集約される。
#[derive(Debug, Error)]
pub enum IngestError {
    /// 必須フィールドの欠落・型不一致（400）
    #[error("不正なデータ構造: {0}")]
    InvalidPayload(String),

    /// リクエストボディがJSONとして解析できない
    #[error("JSONパースエラー: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// 変換できないフィールド（キー/値ペアの要素など）
    #[error("フィールド変換エラー: {0}")]
    MalformedField(String),

    /// ClickHouseへの挿入失敗
    #[error("ストアエラー: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// 呼び出し元に返すステータスコード
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 挿入を試みる前に拒否されたかどうか
    pub fn is_rejection(&self) -> bool {
        matches!(self, IngestError::InvalidPayload(_))
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::InvalidPayload(_) => json_response(
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: INVALID_DATA_MESSAGE.to_string(),
                },
            ),
            _ => json_response(StatusCode::INTERNAL_SERVER_ERROR, StatusBody::failure()),
        }
    }
}

/// JSONレスポンスを構築する
///
/// `Content-Type: application/json` と `Access-Control-Allow-Origin: *` を付与する。
pub fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    cors::allow_any_origin((status, Json(body)).into_response())
}

/// 起動時エラー
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("設定エラー: {0}")]
    Config(#[from] ConfigError),

    #[error("ストア初期化エラー: {0}")]
    Store(#[from] StoreError),

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),
}
