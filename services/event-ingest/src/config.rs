//! 設定
//!
//! 環境変数からサーバー設定とClickHouse接続設定を読み込む。
//! すべての値にフォールバックのデフォルトがある。

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use url::Url;

use crate::ingest::PayloadPolicy;
use crate::store::ConnectionMode;

/// ClickHouseエンドポイント環境変数名
pub const CLICKHOUSE_HOST_ENV: &str = "CLICKHOUSE_HOST";
/// ClickHouseユーザー名環境変数名
pub const CLICKHOUSE_USER_ENV: &str = "CLICKHOUSE_USER";
/// ClickHouseパスワード環境変数名
pub const CLICKHOUSE_PASSWORD_ENV: &str = "CLICKHOUSE_PASSWORD";
/// 挿入先テーブル環境変数名
pub const CLICKHOUSE_TABLE_ENV: &str = "CLICKHOUSE_TABLE";
/// 接続ライフサイクル環境変数名
pub const CLICKHOUSE_CONNECTION_MODE_ENV: &str = "CLICKHOUSE_CONNECTION_MODE";
/// ペイロード検証ポリシー環境変数名
pub const INGEST_PAYLOAD_POLICY_ENV: &str = "INGEST_PAYLOAD_POLICY";
/// リッスンポート環境変数名
pub const PORT_ENV: &str = "PORT";

pub const DEFAULT_CLICKHOUSE_HOST: &str = "http://localhost:8123";
pub const DEFAULT_CLICKHOUSE_USER: &str = "default";
pub const DEFAULT_CLICKHOUSE_PASSWORD: &str = "";
pub const DEFAULT_CLICKHOUSE_TABLE: &str = "events";
pub const DEFAULT_PORT: u16 = 3000;

/// 設定エラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 値が解釈できない
    #[error("環境変数の値が不正です: {name}={value}")]
    InvalidValue { name: String, value: String },

    /// エンドポイントURLが不正
    #[error("ClickHouseエンドポイントURLが不正です: {0}")]
    InvalidUrl(String),
}

/// ClickHouse接続設定
#[derive(Clone)]
pub struct ClickHouseConfig {
    url: Url,
    user: String,
    password: String,
    table: String,
}

impl fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("url", &self.url.as_str())
            .field("user", &self.user)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl ClickHouseConfig {
    /// 新しい設定を作成（テーブルは `events`）
    ///
    /// # 引数
    /// - `url`: ClickHouse HTTPインターフェースのベースURL
    /// - `user`: ユーザー名
    /// - `password`: パスワード
    pub fn new(
        url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let url = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "{url}: http/https以外のスキーム"
            )));
        }

        Ok(Self {
            url,
            user: user.into(),
            password: password.into(),
            table: DEFAULT_CLICKHOUSE_TABLE.to_string(),
        })
    }

    /// 挿入先テーブルを変更する
    ///
    /// クエリ文字列に埋め込むため、英数字・`_`・`.` のみ許可する。
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, ConfigError> {
        let table = table.into();
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(ConfigError::InvalidValue {
                name: CLICKHOUSE_TABLE_ENV.to_string(),
                value: table,
            });
        }
        self.table = table;
        Ok(self)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// サーバー全体の設定
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// ClickHouse接続設定
    pub clickhouse: ClickHouseConfig,
    /// 接続ライフサイクル（リクエスト毎 / プール共有）
    pub connection_mode: ConnectionMode,
    /// attributes/envの検証ポリシー
    pub payload_policy: PayloadPolicy,
    /// リッスンポート
    pub port: u16,
}

impl AppConfig {
    /// 環境変数から設定を読み込み
    ///
    /// # 環境変数
    /// - `CLICKHOUSE_HOST`: エンドポイントURL（デフォルト: http://localhost:8123）
    /// - `CLICKHOUSE_USER`: ユーザー名（デフォルト: default）
    /// - `CLICKHOUSE_PASSWORD`: パスワード（デフォルト: 空文字）
    /// - `CLICKHOUSE_TABLE`: 挿入先テーブル（デフォルト: events）
    /// - `CLICKHOUSE_CONNECTION_MODE`: `per-request` または `pooled`（デフォルト: per-request）
    /// - `INGEST_PAYLOAD_POLICY`: `lenient` または `strict`（デフォルト: lenient）
    /// - `PORT`: リッスンポート（デフォルト: 3000）
    ///
    /// # 戻り値
    /// - `Ok(AppConfig)`: 設定が正常に読み込まれた
    /// - `Err(ConfigError)`: 値が解釈できない
    pub fn from_env() -> Result<Self, ConfigError> {
        let clickhouse = ClickHouseConfig::new(
            &env_or(CLICKHOUSE_HOST_ENV, DEFAULT_CLICKHOUSE_HOST),
            env_or(CLICKHOUSE_USER_ENV, DEFAULT_CLICKHOUSE_USER),
            env_or(CLICKHOUSE_PASSWORD_ENV, DEFAULT_CLICKHOUSE_PASSWORD),
        )?
        .with_table(env_or(CLICKHOUSE_TABLE_ENV, DEFAULT_CLICKHOUSE_TABLE))?;

        let connection_mode = match std::env::var(CLICKHOUSE_CONNECTION_MODE_ENV) {
            Ok(value) => ConnectionMode::parse(&value)
                .ok_or_else(|| invalid(CLICKHOUSE_CONNECTION_MODE_ENV, value))?,
            Err(_) => ConnectionMode::default(),
        };

        let payload_policy = match std::env::var(INGEST_PAYLOAD_POLICY_ENV) {
            Ok(value) => {
                PayloadPolicy::parse(&value).ok_or_else(|| invalid(INGEST_PAYLOAD_POLICY_ENV, value))?
            }
            Err(_) => PayloadPolicy::default(),
        };

        let port = match std::env::var(PORT_ENV) {
            Ok(value) => value.trim().parse().map_err(|_| invalid(PORT_ENV, value))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            clickhouse,
            connection_mode,
            payload_policy,
            port,
        })
    }

    /// リッスンアドレス（全インターフェース）
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn invalid(name: &str, value: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value,
    }
}
