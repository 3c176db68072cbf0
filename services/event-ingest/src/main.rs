//! イベントをClickHouseへ転送するHTTP APIサーバー
//!
//! 本バイナリは以下の機能を提供する:
//! - イベントの取り込み (POST, 任意のパス)
//! - CORSプリフライト応答 (OPTIONS, 任意のパス)
//! - その他のメソッドは404

mod config;
mod cors;
mod error;
mod ingest;
mod logging;
mod store;

use axum::{
    body::Bytes,
    extract::State,
    http::Method,
    response::Response,
    Router,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::StartupError;
use crate::ingest::PayloadPolicy;
use crate::logging::init_logging;
use crate::store::{ClickHouseSink, EventSink};

/// アプリケーション状態
///
/// リクエスト間で共有するのはイベントシンクのみ。
#[derive(Clone)]
pub struct AppState {
    /// 挿入先（ClickHouseまたはテスト用実装）
    pub sink: Arc<dyn EventSink>,
    /// attributes/envの検証ポリシー
    pub payload_policy: PayloadPolicy,
}

impl AppState {
    pub fn new(sink: Arc<dyn EventSink>, payload_policy: PayloadPolicy) -> Self {
        Self {
            sink,
            payload_policy,
        }
    }
}

/// メソッドによる振り分け
///
/// パスは見ない。
/// - OPTIONS: 204 No Content（CORSヘッダー付き）
/// - POST: イベント取り込み
/// - その他: 404 Not Found
async fn front_door(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    match method {
        Method::OPTIONS => cors::preflight(),
        Method::POST => {
            ingest::handle_track_event(state.sink.as_ref(), state.payload_policy, &body).await
        }
        _ => {
            tracing::debug!(method = %method, "未対応のメソッド");
            cors::not_found()
        }
    }
}

/// ルーターを構築する
///
/// すべてのリクエストを `front_door` で受ける。
/// TraceLayerによりリクエスト/レスポンスの構造化ログを自動記録する。
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(front_door)
        // リクエストトレーシングレイヤー（method, path, status, latencyを自動記録）
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// シャットダウンシグナルを待機する
///
/// SIGTERMまたはCtrl+C (SIGINT) を待機し、いずれかを受信したらリターンする。
/// 受信後は新規リクエストの受付を停止し、処理中のリクエストの完了を待つ。
///
/// # Panics
/// シグナルハンドラーの登録に失敗した場合はパニックする。
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Ctrl+C シグナルハンドラーの登録に失敗しました");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM シグナルハンドラーの登録に失敗しました")
            .recv()
            .await;
    };

    // Windows等の非Unix環境ではSIGTERMは利用不可
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C (SIGINT) を受信しました。graceful shutdownを開始します");
        }
        _ = terminate => {
            tracing::info!("SIGTERM を受信しました。graceful shutdownを開始します");
        }
    }
}

/// 設定を読み込み、サーバーを起動する
async fn run() -> Result<(), StartupError> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        clickhouse = %config.clickhouse.url(),
        table = config.clickhouse.table(),
        connection_mode = config.connection_mode.as_str(),
        payload_policy = ?config.payload_policy,
        "設定を読み込みました"
    );

    let sink = ClickHouseSink::new(config.clickhouse.clone(), config.connection_mode)?;
    let app = create_router(AppState::new(Arc::new(sink), config.payload_policy));

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("リッスン開始: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// メイン関数
///
/// # 環境変数
/// `config::AppConfig::from_env` を参照。`RUST_LOG` でログレベルを制御する（デフォルト: info）。
#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    tracing::info!("イベント取り込みサーバーを起動します");

    match run().await {
        Ok(()) => {
            tracing::info!("サーバーが正常に停止しました");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "サーバーの起動に失敗しました");
            ExitCode::FAILURE
        }
    }
}


#[cfg(test)]
mod clickhouse_pipeline_tests {
    //! ClickHouse HTTPインターフェースのモックを使ったエンドツーエンドテスト

    use super::*;
    use crate::config::ClickHouseConfig;
    use crate::store::ConnectionMode;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_app(server: &MockServer, mode: ConnectionMode) -> Router {
        let config = ClickHouseConfig::new(&server.uri(), "default", "").unwrap();
        let sink = ClickHouseSink::new(config, mode).unwrap();
        create_router(AppState::new(Arc::new(sink), PayloadPolicy::Lenient))
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .method("POST")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_event_reaches_clickhouse_as_single_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("query", "INSERT INTO events FORMAT JSONEachRow"))
            .and(query_param("date_time_input_format", "best_effort"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let app = create_app(&server, ConnectionMode::PerRequest);
        let response = app
            .oneshot(post(
                r#"{"event_name":"click","attributes":[{"key":"a","value":"1"},{"key":"b","value":"2"}],"env":[]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let requests = server.received_requests().await.unwrap();
        let row: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(row["app_name"], json!("default"));
        assert_eq!(row["attributes.key"], json!(["a", "b"]));
        assert_eq!(row["attributes.value"], json!(["1", "2"]));
        assert_eq!(row["env.key"], json!([]));
        assert_eq!(row["env.value"], json!([]));
    }

    #[tokio::test]
    async fn test_clickhouse_error_is_reported_uniformly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("Code: 27. DB::Exception: Cannot parse input"),
            )
            .mount(&server)
            .await;

        let app = create_app(&server, ConnectionMode::Pooled);
        let response = app.oneshot(post(r#"{"event_name":"click"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            json!({"status": "error", "message": "Failed to insert event"})
        );
    }

    #[tokio::test]
    async fn test_rejected_event_never_reaches_clickhouse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let app = create_app(&server, ConnectionMode::PerRequest);
        let response = app.oneshot(post(r#"{"app_name":"web"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
