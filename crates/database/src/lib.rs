//! # Strata Database Crate
//!
//! The backend-agnostic data-access layer. One contract, CRUD repositories,
//! a query builder, transactions and read-through caching, over a MongoDB
//! document store or a PostgreSQL/SQLite relational engine.
//!
//! ## Architectural Principles
//!
//! - **One trait, three backends:** [`DatabaseAdapter`] is implemented once per
//!   storage engine and selected at startup from configuration. Callers never
//!   branch on which one is active.
//! - **Schemas resolved once:** a [`CollectionSchema`] is resolved when it is
//!   registered. Scalar fields become real columns on the relational engines;
//!   everything else lives in a JSON blob column and is unpacked on read.
//! - **Errors stop at the facade:** driver failures become [`DbError`]
//!   internally and a [`core_types::DatabaseError`] with a stable code at the
//!   public boundary.
//!
//! ## Public API
//!
//! - [`Database`]: the facade (`crud`, `query`, `cache`, `collection`, `batch`,
//!   `transaction`, `performance`, `connect`/`disconnect`, `health_check`).
//! - [`Repository`]: per-collection CRUD.
//! - [`QueryBuilder`]: fluent queries with offset or cursor pagination and streams.
//! - [`Filter`], [`FindOptions`], [`Stage`]: backend-neutral predicates, options
//!   and aggregation pipelines.

pub mod adapter;
pub mod auth_models;
pub mod backends;
pub mod batch;
pub mod collection;
pub mod connection;
pub mod error;
pub mod facade;
pub mod filter;
pub mod performance;
pub mod pipeline;
pub mod query;
pub mod query_builder;
pub mod repository;
pub mod schema;
pub mod transaction;

pub use adapter::{
    BatchInsertFailure, BatchInsertOutcome, ConnectionSettings, DatabaseAdapter, TransactionScope, UpsertOutcome,
};
pub use backends::{MongoAdapter, PostgresAdapter, SqliteAdapter};
pub use batch::{BatchOperation, BatchOperations, BatchOutcome};
pub use collection::{CollectionModel, CollectionRegistry};
pub use connection::create_adapter;
pub use error::DbError;
pub use facade::{Database, TransactionContext, Utils};
pub use filter::Filter;
pub use performance::{OperationStats, PerformanceMetrics, PerformanceMonitor, SlowQuery};
pub use pipeline::{Accumulator, Operand, Stage};
pub use query::FindOptions;
pub use query_builder::{PaginatedResult, QueryBuilder};
pub use repository::{BatchFailure, BatchInsertResult, BulkWriteResult, Repository, UpsertResult};
pub use schema::{CollectionSchema, FieldDefinition, ResolvedSchema, WriteMode};
pub use transaction::{CompensatingScope, JournalingAdapter};
