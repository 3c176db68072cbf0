//! ClickHouseイベントシンク
//!
//! ClickHouse HTTPインターフェースへ `INSERT ... FORMAT JSONEachRow` を送信する。
//! - 日時は `date_time_input_format=best_effort` で解釈させる
//! - 接続ライフサイクルは `ConnectionMode` で切り替える
//!   - `PerRequest`: 挿入毎にクライアントを生成し、終了後に破棄（アイドル接続を保持しない）
//!   - `Pooled`: 単一クライアントを共有し接続を再利用
//! - 再試行・タイムアウトは行わない

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::{header, Client};
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

use crate::config::ClickHouseConfig;
use crate::ingest::EventRow;

/// ClickHouse認証ユーザーヘッダー
const USER_HEADER: &str = "X-ClickHouse-User";

/// ClickHouse認証パスワードヘッダー
const KEY_HEADER: &str = "X-ClickHouse-Key";

/// 行の送信形式
const INSERT_FORMAT: &str = "JSONEachRow";

/// ストアエラー
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// ClickHouseがエラーステータスを返した
    #[error("HTTPエラー: status={status}, message={message}")]
    Http {
        /// HTTPステータスコード
        status: u16,
        /// ClickHouseのエラーメッセージ
        message: String,
    },

    /// 接続・送信エラー
    #[error("ネットワークエラー: {0}")]
    Network(String),

    /// 行のシリアライズエラー
    #[error("シリアライズエラー: {0}")]
    Serialization(String),

    /// HTTPクライアント構築エラー
    #[error("クライアント構築エラー: {0}")]
    Build(String),
}

/// 挿入行の送信先
///
/// 実装はHTTPハンドラーに注入され、テストでは記録用の実装に差し替える。
#[async_trait]
pub trait EventSink: Send + Sync {
    /// 1行を単一行バッチとして挿入する
    async fn insert_event(&self, row: &EventRow) -> Result<(), StoreError>;
}

/// 接続ライフサイクル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 挿入毎に接続を確立し、挿入後に閉じる
    #[default]
    PerRequest,
    /// 接続をプールしてリクエスト間で再利用する
    Pooled,
}

impl ConnectionMode {
    /// 設定値から変換する（`per-request` / `pooled`）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-request" | "per_request" => Some(Self::PerRequest),
            "pooled" => Some(Self::Pooled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerRequest => "per-request",
            Self::Pooled => "pooled",
        }
    }
}

/// ClickHouse HTTPインターフェース実装
pub struct ClickHouseSink {
    config: ClickHouseConfig,
    mode: ConnectionMode,
    /// Pooledモードでのみ保持する共有クライアント
    shared: Option<Client>,
    /// これまでに生成したクライアント数
    clients_built: AtomicU64,
}

impl fmt::Debug for ClickHouseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseSink")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ClickHouseSink {
    /// 設定からシンクを作成
    ///
    /// Pooledモードではここで共有クライアントを生成する。
    pub fn new(config: ClickHouseConfig, mode: ConnectionMode) -> Result<Self, StoreError> {
        debug!(
            url = %config.url(),
            table = config.table(),
            mode = mode.as_str(),
            "ClickHouseSinkを初期化"
        );

        let mut sink = Self {
            config,
            mode,
            shared: None,
            clients_built: AtomicU64::new(0),
        };

        if mode == ConnectionMode::Pooled {
            sink.shared = Some(sink.build_client()?);
        }

        Ok(sink)
    }

    /// これまでに生成したHTTPクライアント数
    pub fn clients_built(&self) -> u64 {
        self.clients_built.load(Ordering::Relaxed)
    }

    fn build_client(&self) -> Result<Client, StoreError> {
        let builder = match self.mode {
            // アイドル接続を残さず、挿入完了で接続を閉じる
            ConnectionMode::PerRequest => Client::builder().pool_max_idle_per_host(0),
            ConnectionMode::Pooled => Client::builder(),
        };
        let client = builder
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))?;
        self.clients_built.fetch_add(1, Ordering::Relaxed);
        Ok(client)
    }

    fn acquire_client(&self) -> Result<Client, StoreError> {
        match &self.shared {
            Some(client) => Ok(client.clone()),
            None => self.build_client(),
        }
    }

    /// 挿入用URLを構築
    ///
    /// 例: `http://localhost:8123/?query=INSERT+INTO+events+FORMAT+JSONEachRow&date_time_input_format=best_effort`
    fn insert_url(&self) -> Url {
        let mut url = self.config.url().clone();
        url.query_pairs_mut()
            .append_pair(
                "query",
                &format!("INSERT INTO {} FORMAT {}", self.config.table(), INSERT_FORMAT),
            )
            .append_pair("date_time_input_format", "best_effort");
        url
    }

    /// 1行を挿入し、PerRequestモードでは接続を閉じる
    #[instrument(skip(self, row), fields(event_name = %row.event_name, mode = self.mode.as_str()))]
    async fn insert_row(&self, row: &EventRow) -> Result<(), StoreError> {
        let mut body =
            serde_json::to_vec(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
        body.push(b'\n');

        let client = self.acquire_client()?;
        debug!(clients_built = self.clients_built(), "ClickHouse接続を取得");

        let result = self.send_insert(&client, body).await;

        if self.mode == ConnectionMode::PerRequest {
            drop(client);
            debug!("ClickHouse接続をクローズ");
        }

        result
    }

    async fn send_insert(&self, client: &Client, body: Vec<u8>) -> Result<(), StoreError> {
        let response = client
            .post(self.insert_url())
            .header(USER_HEADER, self.config.user())
            .header(KEY_HEADER, self.config.password())
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "ClickHouseへの挿入リクエスト失敗");
                StoreError::Network(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        error!(status = %status, body = %message, "ClickHouse挿入エラー");

        Err(StoreError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl EventSink for ClickHouseSink {
    async fn insert_event(&self, row: &EventRow) -> Result<(), StoreError> {
        self.insert_row(row).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{EventPayload, PayloadPolicy};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_row() -> EventRow {
        let payload = EventPayload::decode(
            json!({
                "event_name": "click",
                "app_name": "web",
                "attributes": [{"key": "a", "value": "1"}, {"key": "b", "value": "2"}],
                "env": [{"key": "os", "value": "linux"}]
            }),
            PayloadPolicy::Lenient,
        )
        .unwrap();
        EventRow::from_payload(payload, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    fn sink_for(server: &MockServer, mode: ConnectionMode) -> ClickHouseSink {
        let config = ClickHouseConfig::new(&server.uri(), "ingest", "secret").unwrap();
        ClickHouseSink::new(config, mode).unwrap()
    }

    // ==================== ConnectionMode テスト ====================

    #[test]
    fn test_connection_mode_parse() {
        assert_eq!(ConnectionMode::parse("per-request"), Some(ConnectionMode::PerRequest));
        assert_eq!(ConnectionMode::parse("PER_REQUEST"), Some(ConnectionMode::PerRequest));
        assert_eq!(ConnectionMode::parse("pooled"), Some(ConnectionMode::Pooled));
        assert_eq!(ConnectionMode::parse("shared"), None);
        assert_eq!(ConnectionMode::default(), ConnectionMode::PerRequest);
    }

    // ==================== URL構築テスト ====================

    #[test]
    fn test_insert_url() {
        let config = ClickHouseConfig::new("http://localhost:8123", "default", "").unwrap();
        let sink = ClickHouseSink::new(config, ConnectionMode::PerRequest).unwrap();

        let url = sink.insert_url();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.path(), "/");
        assert_eq!(
            pairs,
            vec![
                (
                    "query".to_string(),
                    "INSERT INTO events FORMAT JSONEachRow".to_string()
                ),
                (
                    "date_time_input_format".to_string(),
                    "best_effort".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_insert_url_uses_configured_table() {
        let config = ClickHouseConfig::new("http://localhost:8123", "default", "")
            .unwrap()
            .with_table("analytics.events")
            .unwrap();
        let sink = ClickHouseSink::new(config, ConnectionMode::PerRequest).unwrap();

        let query = sink
            .insert_url()
            .query_pairs()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.into_owned());

        assert_eq!(
            query.as_deref(),
            Some("INSERT INTO analytics.events FORMAT JSONEachRow")
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let config = ClickHouseConfig::new("http://localhost:8123", "default", "topsecret").unwrap();
        let sink = ClickHouseSink::new(config, ConnectionMode::Pooled).unwrap();

        let debug = format!("{:?}", sink);
        assert!(debug.contains("ClickHouseSink"));
        assert!(!debug.contains("topsecret"));
    }

    // ==================== 挿入テスト ====================

    #[tokio::test]
    async fn test_insert_event_sends_json_each_row() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("query", "INSERT INTO events FORMAT JSONEachRow"))
            .and(query_param("date_time_input_format", "best_effort"))
            .and(header("X-ClickHouse-User", "ingest"))
            .and(header("X-ClickHouse-Key", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server, ConnectionMode::PerRequest);
        sink.insert_event(&sample_row()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);

        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.ends_with('\n'));
        assert_eq!(body.lines().count(), 1, "単一行バッチであるべき");

        let row: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();
        assert_eq!(
            row,
            json!({
                "app_name": "web",
                "event_name": "click",
                "attributes.key": ["a", "b"],
                "attributes.value": ["1", "2"],
                "env.key": ["os"],
                "env.value": ["linux"],
                "created_at": "2024-01-02T03:04:05.000Z"
            })
        );
    }

    #[tokio::test]
    async fn test_insert_event_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string("Code: 60. DB::Exception: Table default.events does not exist"),
            )
            .mount(&server)
            .await;

        let sink = sink_for(&server, ConnectionMode::PerRequest);
        let result = sink.insert_event(&sample_row()).await;

        match result {
            Err(StoreError::Http { status, message }) => {
                assert_eq!(status, 404);
                assert!(message.contains("does not exist"));
            }
            other => panic!("想定外の結果: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_insert_event_network_error() {
        // 一度バインドして解放したポートへ送信（接続拒否）
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClickHouseConfig::new(&format!("http://{addr}"), "default", "").unwrap();
        let sink = ClickHouseSink::new(config, ConnectionMode::PerRequest).unwrap();

        let result = sink.insert_event(&sample_row()).await;

        assert!(matches!(result, Err(StoreError::Network(_))));
    }

    // ==================== 接続ライフサイクルテスト ====================

    #[tokio::test]
    async fn test_per_request_builds_client_for_each_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let sink = sink_for(&server, ConnectionMode::PerRequest);
        assert_eq!(sink.clients_built(), 0);

        for _ in 0..3 {
            sink.insert_event(&sample_row()).await.unwrap();
        }

        assert_eq!(sink.clients_built(), 3);
    }

    /// 失敗した挿入でも接続は解放され、次の挿入に影響しない
    #[tokio::test]
    async fn test_per_request_failure_does_not_affect_next_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = sink_for(&server, ConnectionMode::PerRequest);

        assert!(sink.insert_event(&sample_row()).await.is_err());
        assert!(sink.insert_event(&sample_row()).await.is_ok());
        assert_eq!(sink.clients_built(), 2);
    }

    #[tokio::test]
    async fn test_pooled_reuses_single_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let sink = sink_for(&server, ConnectionMode::Pooled);
        assert_eq!(sink.clients_built(), 1);

        for _ in 0..3 {
            sink.insert_event(&sample_row()).await.unwrap();
        }

        assert_eq!(sink.clients_built(), 1);
    }

    // ==================== StoreError テスト ====================

    #[test]
    fn test_error_display_http_error() {
        let error = StoreError::Http {
            status: 500,
            message: "Internal Server Error".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("HTTPエラー"));
        assert!(display.contains("500"));
        assert!(display.contains("Internal Server Error"));
    }

    #[test]
    fn test_error_display_network_error() {
        let error = StoreError::Network("connection refused".to_string());
        assert!(error.to_string().contains("ネットワークエラー"));
    }
}
