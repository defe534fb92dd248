/// Engine-specific statements used by connection management and schema
/// discovery.
///
/// Methods returning `Option` yield `None` when the engine has no such
/// statement.
pub trait SqlDialect: Send + Sync {
    /// Quote an identifier (database/table name).
    ///
    /// - PostgreSQL/SQLite: `"name"` (double quotes)
    /// - MySQL: `` `name` `` (backticks)
    fn quote_identifier(&self, name: &str) -> String;

    /// Escape a string for use inside a single-quoted literal.
    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Statement that re-points an open connection at `database`.
    fn switch_database(&self, database: &str) -> Option<String>;

    fn show_databases(&self) -> Option<String>;

    fn create_database(&self, name: &str) -> Option<String> {
        Some(format!("CREATE DATABASE {}", self.quote_identifier(name)))
    }

    fn drop_database(&self, name: &str) -> Option<String> {
        Some(format!("DROP DATABASE {}", self.quote_identifier(name)))
    }

    /// Query whose first column lists the views of `database`.
    fn show_views(&self, database: &str) -> Option<String> {
        Some(format!(
            "SELECT table_name FROM information_schema.views WHERE table_schema = '{}' ORDER BY table_name",
            self.escape_string(database)
        ))
    }
}

/// ANSI conventions (double-quote identifiers). Cannot switch databases on an
/// open connection.
pub struct DefaultSqlDialect;

impl SqlDialect for DefaultSqlDialect {
    fn quote_identifier(&self, name: &str) -> String {
        let escaped = name.replace('"', "\"\"");
        format!("\"{}\"", escaped)
    }

    fn switch_database(&self, _database: &str) -> Option<String> {
        None
    }

    fn show_databases(&self) -> Option<String> {
        None
    }
}
