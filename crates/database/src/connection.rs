use crate::adapter::{ConnectionSettings, DatabaseAdapter};
use crate::backends::{MongoAdapter, PostgresAdapter, SqliteAdapter};
use configuration::{BackendKind, DatabaseSettings};
use std::sync::Arc;

/// Builds the adapter for the configured backend. Nothing is opened until
/// `connect` runs.
pub fn create_adapter(settings: &DatabaseSettings) -> Arc<dyn DatabaseAdapter> {
    let connection = ConnectionSettings::from(settings);
    tracing::debug!(backend = %settings.backend, "Creating database adapter");
    match settings.backend {
        BackendKind::Mongodb => Arc::new(MongoAdapter::new(connection)),
        BackendKind::Postgres => Arc::new(PostgresAdapter::new(connection)),
        BackendKind::Sqlite => Arc::new(SqliteAdapter::new(connection)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Backend;

    #[test]
    fn selects_backend_from_settings() {
        let mut settings = DatabaseSettings::default();
        assert_eq!(create_adapter(&settings).backend(), Backend::Sqlite);
        settings.backend = BackendKind::Postgres;
        assert_eq!(create_adapter(&settings).backend(), Backend::Postgres);
        settings.backend = BackendKind::Mongodb;
        let adapter = create_adapter(&settings);
        assert_eq!(adapter.backend(), Backend::MongoDb);
        assert!(!adapter.is_connected());
    }
}
