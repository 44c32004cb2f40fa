use async_trait::async_trait;
use clickhouse::{query::Query, Client};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ClickHouseConfig;
use crate::error::{AppError, Result};
use crate::models::AnalyticsEventRow;

/// Name of the analytical events table
pub const EVENTS_TABLE: &str = "events";

/// Insert blocks whose dedup tokens the events table remembers
pub const DEDUPLICATION_WINDOW: u64 = 10_000;

/// A bound query parameter. Values never reach the SQL text; the client
/// escapes them into `?` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Str(String),
    UInt(u64),
}

/// SQL template plus parameters in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl BuiltQuery {
    fn bind_all(&self, mut query: Query) -> Query {
        for param in &self.params {
            query = match param {
                QueryParam::Str(s) => query.bind(s.as_str()),
                QueryParam::UInt(n) => query.bind(*n),
            };
        }
        query
    }
}

/// Write side of the analytical store
#[async_trait]
pub trait AnalyticsWriter: Send + Sync {
    /// Append rows in one insert. Repeating a call with the same
    /// `dedup_token` must not duplicate rows.
    async fn write_events(&self, rows: &[AnalyticsEventRow], dedup_token: Uuid) -> Result<()>;
}

#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    server: Client,
    database: String,
    query_timeout: Duration,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        validate_identifier(&config.database)?;

        let server = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_option(
                "max_execution_time",
                (config.timeout_ms / 1000).max(1).to_string(),
            );
        let client = server.clone().with_database(&config.database);

        Ok(Self {
            client,
            server,
            database: config.database.clone(),
            query_timeout: config.timeout(),
        })
    }

    /// Create the database and the events table if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let create_db = format!("CREATE DATABASE IF NOT EXISTS {}", self.database);
        self.with_timeout(self.server.query(&create_db).execute())
            .await?;

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {db}.{table} (
                event_id String,
                occurred_at DateTime('UTC'),
                user_id String,
                event_type String,
                properties String,
                created_at DateTime('UTC') DEFAULT now()
            ) ENGINE = MergeTree()
            PARTITION BY toYYYYMM(occurred_at)
            ORDER BY (occurred_at, user_id, event_type)
            SETTINGS non_replicated_deduplication_window = {window}
            "#,
            db = self.database,
            table = EVENTS_TABLE,
            window = DEDUPLICATION_WINDOW
        );
        self.with_timeout(self.server.query(&create_table).execute())
            .await?;

        // Tables created before the window was raised
        let window = format!(
            "ALTER TABLE {}.{} MODIFY SETTING non_replicated_deduplication_window = {}",
            self.database, EVENTS_TABLE, DEDUPLICATION_WINDOW
        );
        self.with_timeout(self.server.query(&window).execute())
            .await?;

        info!(database = %self.database, "ClickHouse schema ready");
        Ok(())
    }

    pub async fn fetch<T>(&self, query: &BuiltQuery) -> Result<Vec<T>>
    where
        T: DeserializeOwned + clickhouse::Row,
    {
        debug!(
            "Executing ClickHouse query (first 200 chars): {}",
            &query.sql[..query.sql.len().min(200)]
        );

        let bound = query.bind_all(self.client.query(&query.sql));
        self.with_timeout(bound.fetch_all::<T>()).await
    }

    pub async fn health_check(&self) -> Result<()> {
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct HealthCheck {
            _result: u32,
        }

        self.with_timeout(
            self.client
                .query("SELECT toUInt32(1) AS result")
                .fetch_one::<HealthCheck>(),
        )
        .await
        .map(|_| ())
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, clickhouse::error::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("ClickHouse request failed: {}", e);
                Err(AppError::ClickHouse(e.to_string()))
            }
            Err(_) => {
                error!("ClickHouse request timed out after {:?}", self.query_timeout);
                Err(AppError::ClickHouse(format!(
                    "timed out after {}ms",
                    self.query_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl AnalyticsWriter for ClickHouseClient {
    async fn write_events(&self, rows: &[AnalyticsEventRow], dedup_token: Uuid) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let client = insert_client(&self.client, dedup_token);

        let write = async {
            let mut insert = client.insert::<AnalyticsEventRow>(EVENTS_TABLE)?;
            for row in rows {
                insert.write(row).await?;
            }
            insert.end().await
        };

        self.with_timeout(write).await?;

        debug!(
            count = rows.len(),
            dedup_token = %dedup_token,
            "Inserted events into ClickHouse"
        );
        Ok(())
    }
}

/// Settings for a synchronous insert carrying the dedup token. Async inserts
/// skip token deduplication on non-replicated tables, so they stay off.
fn insert_options(dedup_token: Uuid) -> Vec<(&'static str, String)> {
    vec![
        ("async_insert", "0".to_string()),
        ("insert_deduplicate", "1".to_string()),
        ("insert_deduplication_token", dedup_token.to_string()),
    ]
}

fn insert_client(client: &Client, dedup_token: Uuid) -> Client {
    insert_options(dedup_token)
        .into_iter()
        .fold(client.clone(), |client, (name, value)| client.with_option(name, value))
}

fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid ClickHouse database name: {:?}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("analytics").is_ok());
        assert!(validate_identifier("events_test_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("analytics; DROP TABLE events").is_err());
        assert!(validate_identifier("a.b").is_err());
    }

    #[test]
    fn test_writes_are_synchronous_and_tokened() {
        let token = Uuid::new_v4();
        let options: std::collections::HashMap<_, _> = insert_options(token).into_iter().collect();

        assert_eq!(options["async_insert"], "0");
        assert_eq!(options["insert_deduplicate"], "1");
        assert_eq!(options["insert_deduplication_token"], token.to_string());
        assert!(!options.contains_key("async_insert_deduplicate"));
    }

    #[test]
    fn test_client_rejects_bad_database_name() {
        let config = ClickHouseConfig {
            url: "http://localhost:8123".into(),
            database: "x`y".into(),
            user: "default".into(),
            password: String::new(),
            timeout_ms: 1000,
        };
        assert!(matches!(
            ClickHouseClient::new(&config),
            Err(AppError::Validation(_))
        ));
    }
}
