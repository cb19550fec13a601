use super::sql::compile::{self, SqlValue, Statement};
use super::sql::dialect::Dialect;
use super::sql::{SqlAdapter, SqlExecutor, assemble_document};
use crate::adapter::ConnectionSettings;
use crate::error::DbError;
use crate::pipeline::number;
use crate::schema::{ColumnType, FieldPlacement, ResolvedSchema};
use async_trait::async_trait;
use core_types::{Backend, DATA_FIELD, Document};
use resilience::PoolStats;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SqliteAdapter = SqlAdapter<SqliteExecutor>;

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
    tx: Option<SharedTransaction>,
}

/// Whether the URL names a private in-memory database, which lives only as
/// long as its single connection.
fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn build_query(statement: &Statement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    statement
        .binds
        .iter()
        .fold(sqlx::query(&statement.sql), |query, value| match value {
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(*b),
            // JSON is stored as text; json() in the statement parses it back.
            SqlValue::Json(v) => query.bind(v.to_string()),
            SqlValue::Null(ColumnType::Text) => query.bind(None::<String>),
            SqlValue::Null(ColumnType::Real) => query.bind(None::<f64>),
            SqlValue::Null(ColumnType::Integer) => query.bind(None::<i64>),
            SqlValue::Null(ColumnType::Boolean) => query.bind(None::<bool>),
        })
}

fn decode_row(row: &SqliteRow, schema: &ResolvedSchema) -> Result<Document, DbError> {
    let mut data = None;
    let mut columns = Vec::new();
    for (i, name) in compile::columns(schema).into_iter().enumerate() {
        if name == DATA_FIELD {
            if let Some(raw) = row.try_get::<Option<String>, _>(i)? {
                data = Some(serde_json::from_str::<Value>(&raw)?);
            }
            continue;
        }
        let value = match schema.placement(&name) {
            FieldPlacement::Known(ColumnType::Real) => row.try_get::<Option<f64>, _>(i)?.map(number),
            FieldPlacement::Known(ColumnType::Integer) => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
            FieldPlacement::Known(ColumnType::Boolean) => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
            _ => row.try_get::<Option<String>, _>(i)?.map(Value::String),
        };
        if let Some(value) = value {
            columns.push((name, value));
        }
    }
    Ok(assemble_document(data, columns))
}

impl SqliteExecutor {
    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<SqliteRow>, DbError> {
        let query = build_query(statement);
        let rows = match &self.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_mut().ok_or(DbError::TransactionClosed)?;
                query.fetch_all(&mut **conn).await?
            }
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn take_transaction(&self) -> Result<Transaction<'static, Sqlite>, DbError> {
        let slot = self.tx.as_ref().ok_or(DbError::TransactionClosed)?;
        let tx = slot.lock().await.take();
        tx.ok_or(DbError::TransactionClosed)
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    const DIALECT: Dialect = Dialect::Sqlite;
    const BACKEND: Backend = Backend::Sqlite;

    async fn open(settings: &ConnectionSettings) -> Result<Self, DbError> {
        if settings.url.is_empty() {
            return Err(DbError::ConnectionConfig("a SQLite connection URL must be set".into()));
        }
        let options = SqliteConnectOptions::from_str(&settings.url)?.create_if_missing(true);
        let pool_options = SqlitePoolOptions::new().acquire_timeout(settings.acquire_timeout);
        // Every new connection to ":memory:" would see its own empty database,
        // so the pool is pinned to one connection that never expires.
        let pool_options = if is_in_memory(&settings.url) {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(settings.max_pool_size)
                .min_connections(settings.min_pool_size)
        };
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool, tx: None })
    }

    async fn close(&self) {
        if self.tx.is_none() {
            self.pool.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn pool_stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            total_connections: self.pool.options().get_max_connections(),
            active_connections: size.saturating_sub(idle),
            idle_connections: idle,
            waiting_requests: 0,
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, DbError> {
        let query = build_query(statement);
        let result = match &self.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_mut().ok_or(DbError::TransactionClosed)?;
                query.execute(&mut **conn).await?
            }
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn fetch_documents(&self, statement: &Statement, schema: &ResolvedSchema) -> Result<Vec<Document>, DbError> {
        self.fetch_all(statement)
            .await?
            .iter()
            .map(|row| decode_row(row, schema))
            .collect()
    }

    async fn fetch_strings(&self, statement: &Statement) -> Result<Vec<String>, DbError> {
        self.fetch_all(statement)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>(0).map_err(DbError::from))
            .collect()
    }

    async fn fetch_count(&self, statement: &Statement) -> Result<u64, DbError> {
        let rows = self.fetch_all(statement).await?;
        let count = match rows.first() {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn begin(&self) -> Result<Option<Self>, DbError> {
        if self.tx.is_some() {
            return Ok(None);
        }
        // Take the write lock up front; a deferred transaction that upgrades
        // from a read lock can fail with SQLITE_BUSY without waiting.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Some(Self {
            pool: self.pool.clone(),
            tx: Some(Arc::new(Mutex::new(Some(tx)))),
        }))
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.take_transaction().await?.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.take_transaction().await?.rollback().await?;
        Ok(())
    }
}
