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
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type PostgresAdapter = SqlAdapter<PgExecutor>;

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Runs statements on a `PgPool`, or on one open transaction.
#[derive(Debug, Clone)]
pub struct PgExecutor {
    pool: PgPool,
    tx: Option<SharedTransaction>,
}

fn build_query(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
    statement
        .binds
        .iter()
        .fold(sqlx::query(&statement.sql), |query, value| match value {
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Json(v) => query.bind(Json(v)),
            SqlValue::Null(ColumnType::Text) => query.bind(None::<String>),
            SqlValue::Null(ColumnType::Real) => query.bind(None::<f64>),
            SqlValue::Null(ColumnType::Integer) => query.bind(None::<i64>),
            SqlValue::Null(ColumnType::Boolean) => query.bind(None::<bool>),
        })
}

fn decode_row(row: &PgRow, schema: &ResolvedSchema) -> Result<Document, DbError> {
    let mut data = None;
    let mut columns = Vec::new();
    for (i, name) in compile::columns(schema).into_iter().enumerate() {
        if name == DATA_FIELD {
            data = row.try_get::<Option<Json<Value>>, _>(i)?.map(|json| json.0);
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

impl PgExecutor {
    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<PgRow>, DbError> {
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

    async fn take_transaction(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        let slot = self.tx.as_ref().ok_or(DbError::TransactionClosed)?;
        let tx = slot.lock().await.take();
        tx.ok_or(DbError::TransactionClosed)
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    const DIALECT: Dialect = Dialect::Postgres;
    const BACKEND: Backend = Backend::Postgres;

    async fn open(settings: &ConnectionSettings) -> Result<Self, DbError> {
        if settings.url.is_empty() {
            return Err(DbError::ConnectionConfig("a Postgres connection URL must be set".into()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_pool_size)
            .min_connections(settings.min_pool_size)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await?;
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
        let tx = self.pool.begin().await?;
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
