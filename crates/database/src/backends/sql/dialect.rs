use crate::schema::ColumnType;

/// The SQL flavor a statement is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Placeholder for the `index`-th bind (1-based). SQLite binds positionally,
    /// so statements push binds in text order for both dialects.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    pub fn column_type(self, column: ColumnType) -> &'static str {
        match (self, column) {
            (_, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Real) => "DOUBLE PRECISION",
            (Dialect::Sqlite, ColumnType::Real) => "REAL",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Postgres, ColumnType::Boolean) => "BOOLEAN",
            (Dialect::Sqlite, ColumnType::Boolean) => "INTEGER",
        }
    }

    pub fn data_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "JSONB",
            Dialect::Sqlite => "TEXT",
        }
    }

    pub fn empty_data(self) -> &'static str {
        match self {
            Dialect::Postgres => "'{}'::jsonb",
            Dialect::Sqlite => "'{}'",
        }
    }

    /// JSON-valued expression for a path inside the `_data` blob. Path
    /// segments are validated identifiers, so they are inlined.
    pub fn dynamic_json(self, path: &str) -> String {
        match self {
            Dialect::Postgres => format!("(\"_data\" #> '{{{}}}')", path.replace('.', ",")),
            Dialect::Sqlite => format!("json_extract(\"_data\", '$.{path}')"),
        }
    }

    /// Text-valued expression for a path inside the `_data` blob.
    pub fn dynamic_text(self, path: &str) -> String {
        match self {
            Dialect::Postgres => format!("(\"_data\" #>> '{{{}}}')", path.replace('.', ",")),
            Dialect::Sqlite => self.dynamic_json(path),
        }
    }

    /// True when the path is present in the blob, even if it holds `null`.
    pub fn dynamic_present(self, path: &str) -> String {
        match self {
            Dialect::Postgres => format!("{} IS NOT NULL", self.dynamic_json(path)),
            Dialect::Sqlite => format!("json_type(\"_data\", '$.{path}') IS NOT NULL"),
        }
    }

    /// True when the path is missing or holds `null`.
    pub fn dynamic_null(self, path: &str) -> String {
        let expr = self.dynamic_json(path);
        match self {
            Dialect::Postgres => format!("({expr} IS NULL OR {expr} = 'null'::jsonb)"),
            Dialect::Sqlite => format!("{expr} IS NULL"),
        }
    }

    /// 1-based position of `needle` in `haystack`, 0 when absent.
    pub fn position(self, haystack: &str, needle: &str) -> String {
        match self {
            Dialect::Postgres => format!("strpos({haystack}, {needle})"),
            Dialect::Sqlite => format!("instr({haystack}, {needle})"),
        }
    }

    pub fn list_tables(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name"
            }
            Dialect::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
        }
    }

    /// Column names of a table; takes the table name as its only bind.
    pub fn table_columns(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?)",
        }
    }
}

pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
