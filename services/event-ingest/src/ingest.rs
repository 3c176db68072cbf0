//! イベント取り込みハンドラー
//!
//! 1リクエスト = 1行挿入。処理の流れ:
//! 1. ボディをJSONとして解析（失敗は500）
//! 2. 型付きペイロードへデコードし必須フィールドを検証（不正は400）
//! 3. attributes/envのキー/値ペアを位置を保ったまま2本の配列に分解
//! 4. サーバー時刻をcreated_atとした挿入行を構築
//! 5. EventSinkへ単一行として送信
//!
//! どの段階で失敗しても再試行はせず、そのリクエストは失敗として応答する。

use axum::{http::StatusCode, response::IntoResponse, response::Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{json_response, IngestError, StatusBody};
use crate::store::EventSink;

/// app_name未指定時の値
pub const DEFAULT_APP_NAME: &str = "default";

/// attributes/env未指定時に補うペアのキーと値
pub const DEFAULT_PAIR_VALUE: &str = "default";

/// attributes/envの検証ポリシー
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadPolicy {
    /// 欠落・配列以外は `{key: "default", value: "default"}` の1ペアで補う
    #[default]
    Lenient,
    /// 両方とも配列であることを必須とし、違反は400
    Strict,
}

impl PayloadPolicy {
    /// 設定値から変換する（`lenient` / `strict`）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lenient" => Some(Self::Lenient),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// キー/値ペア
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(deserialize_with = "scalar_as_string")]
    pub key: String,
    #[serde(deserialize_with = "scalar_as_string")]
    pub value: String,
}

/// 文字列・数値・真偽値を文字列として受け取る
///
/// オブジェクト・配列・nullはエラー。
fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!(
            "文字列・数値・真偽値のいずれでもありません: {other}"
        ))),
    }
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Lenientポリシーで補うペア
    pub fn placeholder() -> Self {
        Self::new(DEFAULT_PAIR_VALUE, DEFAULT_PAIR_VALUE)
    }
}

/// 検証済みの受信イベント
///
/// `created_at` は受け取っても保持しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPayload {
    pub event_name: String,
    pub app_name: Option<String>,
    pub attributes: Vec<KeyValue>,
    pub env: Vec<KeyValue>,
}

impl EventPayload {
    /// JSON値から型付きペイロードへデコードする
    ///
    /// # 戻り値
    /// * `Err(IngestError::InvalidPayload)` - event_nameが空・欠落・文字列以外、
    ///   またはStrictポリシーでattributes/envが配列でない
    /// * `Err(IngestError::MalformedField)` - ボディがnull、またはapp_nameやペア要素が変換できない
    pub fn decode(value: Value, policy: PayloadPolicy) -> Result<Self, IngestError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            Value::Null => {
                return Err(IngestError::MalformedField(
                    "ボディがnullです".to_string(),
                ));
            }
            _ => {
                return Err(IngestError::InvalidPayload(
                    "ボディがJSONオブジェクトではありません".to_string(),
                ));
            }
        };

        let event_name = match fields.remove("event_name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(IngestError::InvalidPayload(
                    "event_nameがありません".to_string(),
                ));
            }
        };

        let attributes = take_pairs(&mut fields, "attributes", policy)?;
        let env = take_pairs(&mut fields, "env", policy)?;

        let app_name = match fields.remove("app_name") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name),
            Some(other) => {
                return Err(IngestError::MalformedField(format!(
                    "app_nameが文字列ではありません: {other}"
                )));
            }
        };

        Ok(Self {
            event_name,
            app_name,
            attributes: attributes.into_pairs()?,
            env: env.into_pairs()?,
        })
    }
}

/// 検証段階で取り出した、まだ要素を変換していないペア列
enum RawPairs {
    Items(&'static str, Vec<Value>),
    Placeholder,
}

impl RawPairs {
    fn into_pairs(self) -> Result<Vec<KeyValue>, IngestError> {
        match self {
            RawPairs::Placeholder => Ok(vec![KeyValue::placeholder()]),
            RawPairs::Items(field, items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<KeyValue>(item).map_err(|e| {
                        IngestError::MalformedField(format!("{field}[{index}]: {e}"))
                    })
                })
                .collect(),
        }
    }
}

fn take_pairs(
    fields: &mut Map<String, Value>,
    field: &'static str,
    policy: PayloadPolicy,
) -> Result<RawPairs, IngestError> {
    match (fields.remove(field), policy) {
        (Some(Value::Array(items)), _) => Ok(RawPairs::Items(field, items)),
        (_, PayloadPolicy::Lenient) => Ok(RawPairs::Placeholder),
        (_, PayloadPolicy::Strict) => Err(IngestError::InvalidPayload(format!(
            "{field}が配列ではありません"
        ))),
    }
}

/// 位置を揃えたキー列と値列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairColumns {
    pub keys: Vec<String>,
    pub values: Vec<String>,
}

/// キー/値ペア列をキー列と値列に分解する（順序は元のまま）
pub fn unzip_pairs(pairs: Vec<KeyValue>) -> PairColumns {
    let (keys, values) = pairs.into_iter().map(|kv| (kv.key, kv.value)).unzip();
    PairColumns { keys, values }
}

/// ClickHouseへ送る挿入行
///
/// Nested列 `attributes` / `env` はドット区切りの列名で配列として送る。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub app_name: String,
    pub event_name: String,
    #[serde(rename = "attributes.key")]
    pub attributes_key: Vec<String>,
    #[serde(rename = "attributes.value")]
    pub attributes_value: Vec<String>,
    #[serde(rename = "env.key")]
    pub env_key: Vec<String>,
    #[serde(rename = "env.value")]
    pub env_value: Vec<String>,
    /// RFC 3339（ミリ秒、UTC）。ClickHouse側はbest_effortで解釈する
    pub created_at: String,
}

impl EventRow {
    /// 検証済みペイロードから挿入行を構築する
    pub fn from_payload(payload: EventPayload, created_at: DateTime<Utc>) -> Self {
        let attributes = unzip_pairs(payload.attributes);
        let env = unzip_pairs(payload.env);

        Self {
            app_name: payload
                .app_name
                .unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            event_name: payload.event_name,
            attributes_key: attributes.keys,
            attributes_value: attributes.values,
            env_key: env.keys,
            env_value: env.values,
            created_at: format_created_at(created_at),
        }
    }
}

/// created_atの送信形式（例: "2023-12-06T10:54:48.000Z"）
pub fn format_created_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// リクエストボディを取り込み、1行挿入する
///
/// # 戻り値
/// * `Ok(EventRow)` - 挿入に成功した行
/// * `Err(IngestError)` - 拒否または失敗
pub async fn ingest_event(
    sink: &dyn EventSink,
    policy: PayloadPolicy,
    body: &[u8],
) -> Result<EventRow, IngestError> {
    let value: Value = serde_json::from_slice(body)?;
    let payload = EventPayload::decode(value, policy)?;
    let row = EventRow::from_payload(payload, Utc::now());

    sink.insert_event(&row).await?;

    Ok(row)
}

/// POSTリクエストのハンドラー
///
/// # Returns
/// - 200 OK: `{"status":"success","message":"Event inserted"}`
/// - 400 Bad Request: `{"error":"Invalid data structure"}`
/// - 500 Internal Server Error: `{"status":"error","message":"Failed to insert event"}`
pub async fn handle_track_event(
    sink: &dyn EventSink,
    policy: PayloadPolicy,
    body: &[u8],
) -> Response {
    tracing::info!(body_len = body.len(), "イベント受信");

    match ingest_event(sink, policy, body).await {
        Ok(row) => {
            tracing::info!(
                event_name = %row.event_name,
                app_name = %row.app_name,
                attribute_count = row.attributes_key.len(),
                env_count = row.env_key.len(),
                "イベントを挿入"
            );
            json_response(StatusCode::OK, StatusBody::success())
        }
        Err(e) if e.is_rejection() => {
            tracing::warn!(error = %e, status = %e.status(), "不正なイベントを拒否");
            e.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, status = %e.status(), "イベント挿入エラー");
            e.into_response()
        }
    }
}
