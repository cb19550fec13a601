use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to serialize value for cache key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
