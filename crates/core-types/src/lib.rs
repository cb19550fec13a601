//! # Strata Core Types
//!
//! The leaf crate of the workspace. It defines the uniform contract every other
//! crate speaks: the `DatabaseResult<T>` envelope, the `DatabaseError` taxonomy,
//! the backend-neutral `Document`, the `BaseEntity` system fields, and the
//! identifier utilities exposed to consumers.

pub mod entity;
pub mod enums;
pub mod error;
pub mod id;
pub mod result;

// Re-export the core types to provide a clean public API.
pub use entity::{
    BaseEntity, CREATED_AT_FIELD, DATA_FIELD, Document, ID_FIELD, UPDATED_AT_FIELD, from_document,
    timestamp_now, to_document,
};
pub use enums::{Backend, FieldType, SortDirection};
pub use error::{DatabaseError, ErrorCode};
pub use id::{generate_id, normalize_path, validate_id};
pub use result::{DatabaseResult, Envelope, ResultMeta};
