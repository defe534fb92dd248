use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dbharbor_core::{
    ColumnMeta, Connection, ConnectionNode, DatabaseInfo, DbDriver, DbError, DbKind, QueryRequest,
    QueryResult, Row, SqlDialect, Value,
};
use mysql::prelude::*;
use mysql::{Conn, Opts, OptsBuilder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

pub struct MysqlDialect;

impl SqlDialect for MysqlDialect {
    fn quote_identifier(&self, name: &str) -> String {
        mysql_quote_ident(name)
    }

    fn escape_string(&self, s: &str) -> String {
        mysql_escape_string(s)
    }

    fn switch_database(&self, database: &str) -> Option<String> {
        Some(format!("USE {}", mysql_quote_ident(database)))
    }

    fn show_databases(&self) -> Option<String> {
        Some("SHOW DATABASES".to_string())
    }

    fn show_views(&self, database: &str) -> Option<String> {
        Some(format!(
            "SELECT TABLE_NAME FROM information_schema.VIEWS WHERE TABLE_SCHEMA = '{}' ORDER BY TABLE_NAME",
            mysql_escape_string(database)
        ))
    }
}

static MYSQL_DIALECT: MysqlDialect = MysqlDialect;

/// Driver for MySQL and MariaDB servers.
///
/// The node handed to [`DbDriver::connect`] is already tunneled when it came
/// through an SSH bastion, so this only ever dials host and port directly.
pub struct MysqlDriver {
    kind: DbKind,
}

impl MysqlDriver {
    pub fn new(kind: DbKind) -> Self {
        Self { kind }
    }
}

impl Default for MysqlDriver {
    fn default() -> Self {
        Self::new(DbKind::MySQL)
    }
}

impl DbDriver for MysqlDriver {
    fn kind(&self) -> DbKind {
        self.kind
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &MYSQL_DIALECT
    }

    fn connect(&self, node: &ConnectionNode) -> Result<Box<dyn Connection>, DbError> {
        log::info!(
            "[CONNECT] {} at {}:{} as {} (database: {:?})",
            self.kind.display_name(),
            node.host,
            node.port,
            node.user,
            node.database
        );

        let started = Instant::now();
        let opts = build_mysql_opts(node);
        let conn = Conn::new(opts).map_err(|e| format_mysql_error(&e, &node.host, node.port))?;

        log::info!(
            "[CONNECT] established in {:.2}ms",
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Box::new(MysqlConnection {
            state: Mutex::new(Some(SessionState {
                conn,
                current_database: node.database.clone().filter(|db| !db.is_empty()),
            })),
            broken: AtomicBool::new(false),
            kind: self.kind,
        }))
    }
}

fn build_mysql_opts(node: &ConnectionNode) -> Opts {
    let mut builder = OptsBuilder::new()
        .ip_or_hostname(Some(node.host.as_str()))
        .tcp_port(node.port)
        .user(Some(node.user.as_str()))
        .pass(node.password())
        .tcp_connect_timeout(Some(CONNECT_TIMEOUT));

    if let Some(db) = node.database.as_deref().filter(|db| !db.is_empty()) {
        builder = builder.db_name(Some(db));
    }

    builder.into()
}

struct SessionState {
    conn: Conn,
    current_database: Option<String>,
}

/// One MySQL session. `None` state means the session was closed.
pub struct MysqlConnection {
    state: Mutex<Option<SessionState>>,

    /// Set once the socket failed; the session is not reused afterwards.
    broken: AtomicBool,
    kind: DbKind,
}

impl MysqlConnection {
    fn lock_state(&self) -> MutexGuard<'_, Option<SessionState>> {
        self.state.lock().unwrap_or_else(|poison| {
            log::warn!("[CLEANUP] Recovering from poisoned mysql session mutex");
            poison.into_inner()
        })
    }

    fn note_failure(&self, e: &mysql::Error) {
        if matches!(e, mysql::Error::IoError(_) | mysql::Error::DriverError(_)) {
            log::warn!("[CONNECT] session marked dead: {}", e);
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    fn use_database(&self, state: &mut SessionState, database: &str) -> Result<(), DbError> {
        log::debug!("[USE] Switching to database: {}", database);

        state
            .conn
            .query_drop(format!("USE {}", mysql_quote_ident(database)))
            .map_err(|e| {
                self.note_failure(&e);
                DbError::query_failed(format!("USE {} failed: {}", database, e))
            })?;

        state.current_database = Some(database.to_string());
        Ok(())
    }
}

impl Connection for MysqlConnection {
    fn is_alive(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && self.lock_state().is_some()
    }

    fn ping(&self) -> Result<(), DbError> {
        let mut guard = self.lock_state();
        let state = guard
            .as_mut()
            .ok_or_else(|| DbError::connection_failed("session is closed"))?;

        state.conn.query_drop("SELECT 1").map_err(|e| {
            self.note_failure(&e);
            format_mysql_query_error(&e)
        })
    }

    fn close(&self) -> Result<(), DbError> {
        if let Some(state) = self.lock_state().take() {
            log::debug!(
                "[CLEANUP] closing mysql session (database: {:?})",
                state.current_database
            );
        }
        Ok(())
    }

    fn execute(&self, req: &QueryRequest) -> Result<QueryResult, DbError> {
        let start = Instant::now();

        let sql_preview = if req.sql.chars().count() > 80 {
            format!("{}...", req.sql.chars().take(80).collect::<String>())
        } else {
            req.sql.clone()
        };
        log::debug!("[QUERY] Executing: {}", sql_preview.replace('\n', " "));

        let mut guard = self.lock_state();
        let state = guard
            .as_mut()
            .ok_or_else(|| DbError::connection_failed("session is closed"))?;

        if let Some(db) = req.database.as_deref().filter(|db| !db.is_empty())
            && state.current_database.as_deref() != Some(db)
        {
            self.use_database(state, db)?;
        }

        // USE is not accepted by the prepared statement protocol.
        if let Some(target) = parse_use_statement(&req.sql) {
            self.use_database(state, &target)?;
            return Ok(QueryResult {
                execution_time: start.elapsed(),
                ..QueryResult::empty()
            });
        }

        let stmt = state.conn.prep(&req.sql).map_err(|e| {
            self.note_failure(&e);
            format_mysql_query_error(&e)
        })?;

        let columns: Vec<ColumnMeta> = stmt
            .columns()
            .iter()
            .map(|col| ColumnMeta {
                name: col.name_str().to_string(),
                type_name: format!("{:?}", col.column_type()),
                nullable: true,
            })
            .collect();

        let rows: Vec<mysql::Row> = state.conn.exec(&stmt, ()).map_err(|e| {
            self.note_failure(&e);
            format_mysql_query_error(&e)
        })?;

        let execution_time = start.elapsed();

        if columns.is_empty() {
            let affected = state.conn.affected_rows();
            log::debug!(
                "[QUERY] Completed in {:.2}ms, {} rows affected",
                execution_time.as_secs_f64() * 1000.0,
                affected
            );
            return Ok(QueryResult {
                columns,
                rows: Vec::new(),
                affected_rows: Some(affected),
                execution_time,
            });
        }

        let result_rows: Vec<Row> = rows
            .iter()
            .map(|row| {
                let row_cols = row.columns_ref();
                (0..columns.len())
                    .map(|i| mysql_value_to_value(row, i, &row_cols[i]))
                    .collect()
            })
            .collect();

        log::debug!(
            "[QUERY] Completed in {:.2}ms, {} rows",
            execution_time.as_secs_f64() * 1000.0,
            result_rows.len()
        );

        Ok(QueryResult {
            columns,
            rows: result_rows,
            affected_rows: None,
            execution_time,
        })
    }

    fn list_databases(&self) -> Result<Vec<DatabaseInfo>, DbError> {
        let mut guard = self.lock_state();
        let state = guard
            .as_mut()
            .ok_or_else(|| DbError::connection_failed("session is closed"))?;

        let databases: Vec<String> = state.conn.query("SHOW DATABASES").map_err(|e| {
            self.note_failure(&e);
            format_mysql_query_error(&e)
        })?;

        let current = state.current_database.as_deref();

        Ok(databases
            .into_iter()
            .filter(|db| !SYSTEM_SCHEMAS.contains(&db.as_str()))
            .map(|name| DatabaseInfo {
                is_current: current == Some(name.as_str()),
                name,
            })
            .collect())
    }

    fn current_database(&self) -> Option<String> {
        self.lock_state()
            .as_ref()
            .and_then(|state| state.current_database.clone())
    }

    fn kind(&self) -> DbKind {
        self.kind
    }
}

/// Target of a `USE <db>` statement, unquoted.
fn parse_use_statement(sql: &str) -> Option<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let keyword = trimmed.get(..3)?;
    if !keyword.eq_ignore_ascii_case("use") {
        return None;
    }

    let rest = &trimmed[3..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let name = rest.trim();
    let name = match name.strip_prefix('`').and_then(|n| n.strip_suffix('`')) {
        Some(quoted) => quoted.replace("``", "`"),
        None => name.to_string(),
    };

    (!name.is_empty()).then_some(name)
}

fn format_mysql_error(e: &mysql::Error, host: &str, port: u16) -> DbError {
    let msg = e.to_string();

    if msg.contains("Connection refused") {
        DbError::connection_failed(format!(
            "Connection refused at {}:{}. Is MySQL running?",
            host, port
        ))
    } else if msg.contains("Access denied") {
        DbError::connection_failed("Access denied for user. Check username and password.")
    } else if msg.contains("Unknown database") {
        DbError::connection_failed("Database does not exist.")
    } else if msg.contains("caching_sha2_password")
        || msg.contains("Authentication requires secure connection")
    {
        DbError::connection_failed(
            "Authentication failed. The server requires a secure connection for \
             caching_sha2_password.",
        )
    } else {
        DbError::connection_failed(msg)
    }
}

fn format_mysql_query_error(e: &mysql::Error) -> DbError {
    let message = match e {
        mysql::Error::MySqlError(mysql_err) => {
            let mut parts = vec![mysql_err.message.clone(), format!("Code: {}", mysql_err.code)];

            if !mysql_err.state.is_empty() {
                parts.push(format!("State: {}", mysql_err.state));
            }

            parts.join(". ")
        }
        _ => e.to_string(),
    };

    log::error!("MySQL query failed: {}", message);
    DbError::QueryFailed(message)
}

/// Read a cell as a typed value, falling through to text and then bytes.
fn mysql_value_to_value(row: &mysql::Row, idx: usize, col: &mysql::Column) -> Value {
    use mysql::consts::{ColumnFlags, ColumnType};

    let col_type = col.column_type();

    // TINYINT(1) is MySQL's boolean type
    if col_type == ColumnType::MYSQL_TYPE_TINY
        && col.column_length() == 1
        && let Some(Ok(val)) = row.get_opt::<Option<i8>, _>(idx)
    {
        return val.map(|v| Value::Bool(v != 0)).unwrap_or(Value::Null);
    }

    if col_type == ColumnType::MYSQL_TYPE_LONGLONG
        && col.flags().contains(ColumnFlags::UNSIGNED_FLAG)
        && let Some(Ok(val)) = row.get_opt::<Option<u64>, _>(idx)
    {
        return match val {
            Some(v) => i64::try_from(v)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(v.to_string())),
            None => Value::Null,
        };
    }

    if matches!(
        col_type,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL
    ) && let Some(Ok(val)) = row.get_opt::<Option<String>, _>(idx)
    {
        return val.map(Value::Decimal).unwrap_or(Value::Null);
    }

    if matches!(
        col_type,
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_TIMESTAMP
    ) && let Some(Ok(val)) = row.get_opt::<Option<String>, _>(idx)
    {
        return match val {
            Some(s) => chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| Value::DateTime(naive.and_utc()))
                .unwrap_or(Value::Text(s)),
            None => Value::Null,
        };
    }

    if col_type == ColumnType::MYSQL_TYPE_DATE
        && let Some(Ok(val)) = row.get_opt::<Option<String>, _>(idx)
    {
        return match val {
            Some(s) => chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(Value::Date)
                .unwrap_or(Value::Text(s)),
            None => Value::Null,
        };
    }

    if col_type == ColumnType::MYSQL_TYPE_TIME
        && let Some(Ok(val)) = row.get_opt::<Option<String>, _>(idx)
    {
        return match val {
            Some(s) => chrono::NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                .map(Value::Time)
                .unwrap_or(Value::Text(s)),
            None => Value::Null,
        };
    }

    if let Some(Ok(val)) = row.get_opt::<Option<i64>, _>(idx) {
        return val.map(Value::Int).unwrap_or(Value::Null);
    }

    if let Some(Ok(val)) = row.get_opt::<Option<f64>, _>(idx) {
        return val.map(Value::Float).unwrap_or(Value::Null);
    }

    if let Some(Ok(val)) = row.get_opt::<Option<String>, _>(idx) {
        return val.map(Value::Text).unwrap_or(Value::Null);
    }

    row.get_opt::<Option<Vec<u8>>, _>(idx)
        .and_then(|r| r.ok())
        .flatten()
        .map(Value::Bytes)
        .unwrap_or(Value::Null)
}

fn mysql_quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Escape a string for use inside a MySQL single-quoted literal.
fn mysql_escape_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('\0', "\\0")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
