use dbharbor_core::{
    Connection, ConnectionNode, DatabaseInfo, DbDriver, DbError, DbKind, DefaultSqlDialect,
    QueryRequest, QueryResult, SqlDialect,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FakeQueryOutcome {
    Success(QueryResult),
    Error(String),
}

impl FakeQueryOutcome {
    fn to_result(&self) -> Result<QueryResult, DbError> {
        match self {
            Self::Success(result) => Ok(result.clone()),
            Self::Error(message) => Err(DbError::query_failed(message.clone())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDriverStats {
    /// Every `connect` call, failed ones included.
    pub connect_calls: usize,
    /// Parameters each `connect` call received.
    pub connected_nodes: Vec<ConnectionNode>,
    pub executed_requests: Vec<QueryRequest>,
    pub list_databases_calls: usize,
    pub close_calls: usize,
}

impl FakeDriverStats {
    pub fn executed_sql(&self) -> Vec<&str> {
        self.executed_requests
            .iter()
            .map(|req| req.sql.as_str())
            .collect()
    }
}

/// MySQL-flavoured statements so re-pointing issues a real `USE`.
pub struct FakeSqlDialect;

impl SqlDialect for FakeSqlDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn switch_database(&self, database: &str) -> Option<String> {
        Some(format!("USE {}", self.quote_identifier(database)))
    }

    fn show_databases(&self) -> Option<String> {
        Some("SHOW DATABASES".to_string())
    }
}

static FAKE_SQL_DIALECT: FakeSqlDialect = FakeSqlDialect;
static DEFAULT_SQL_DIALECT: DefaultSqlDialect = DefaultSqlDialect;

#[derive(Default)]
struct FakeDriverState {
    databases: RwLock<Vec<DatabaseInfo>>,
    query_outcomes: RwLock<HashMap<String, FakeQueryOutcome>>,
    default_outcome: RwLock<Option<FakeQueryOutcome>>,
    executed_requests: Mutex<Vec<QueryRequest>>,
    connected_nodes: Mutex<Vec<ConnectionNode>>,
    connect_calls: AtomicUsize,
    list_databases_calls: AtomicUsize,
    close_calls: AtomicUsize,
    /// Remaining connects that fail before connects start succeeding.
    failing_connects: AtomicUsize,
    connect_error: RwLock<Option<String>>,
    connect_delay: RwLock<Option<Duration>>,
    close_error: RwLock<Option<String>>,
    /// Generation of the newest connection handed out.
    generation: AtomicUsize,
    /// Connections at or below this generation report themselves dead.
    killed_through: AtomicUsize,
}

/// In-memory `DbDriver` whose connections share observable state.
#[derive(Clone)]
pub struct FakeDriver {
    kind: DbKind,
    dialect: &'static dyn SqlDialect,
    state: Arc<FakeDriverState>,
}

impl FakeDriver {
    pub fn new(kind: DbKind) -> Self {
        Self {
            kind,
            dialect: &FAKE_SQL_DIALECT,
            state: Arc::new(FakeDriverState::default()),
        }
    }

    pub fn with_databases(self, names: &[&str]) -> Self {
        *rwlock_write(&self.state.databases) =
            names.iter().map(|name| DatabaseInfo::new(*name)).collect();
        self
    }

    pub fn with_query_result(self, sql: impl Into<String>, result: QueryResult) -> Self {
        rwlock_write(&self.state.query_outcomes)
            .insert(sql.into(), FakeQueryOutcome::Success(result));
        self
    }

    pub fn with_query_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        rwlock_write(&self.state.query_outcomes)
            .insert(sql.into(), FakeQueryOutcome::Error(message.into()));
        self
    }

    pub fn with_default_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.default_outcome) = Some(FakeQueryOutcome::Error(message.into()));
        self
    }

    /// Every connect fails with `message`.
    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.connect_error) = Some(message.into());
        self
    }

    /// The next `count` connects fail, later ones succeed.
    pub fn with_failing_connects(self, count: usize) -> Self {
        self.state.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *rwlock_write(&self.state.connect_delay) = Some(delay);
        self
    }

    pub fn with_close_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.close_error) = Some(message.into());
        self
    }

    /// Use a dialect with no switch-database statement.
    pub fn without_switch_statement(mut self) -> Self {
        self.dialect = &DEFAULT_SQL_DIALECT;
        self
    }

    pub fn set_query_outcome(&self, sql: impl Into<String>, outcome: FakeQueryOutcome) {
        rwlock_write(&self.state.query_outcomes).insert(sql.into(), outcome);
    }

    /// Make every connection created so far report itself dead.
    pub fn kill_connections(&self) {
        let newest = self.state.generation.load(Ordering::SeqCst);
        self.state.killed_through.store(newest, Ordering::SeqCst);
    }

    pub fn stats(&self) -> FakeDriverStats {
        FakeDriverStats {
            connect_calls: self.state.connect_calls.load(Ordering::SeqCst),
            connected_nodes: mutex_lock(&self.state.connected_nodes).clone(),
            executed_requests: mutex_lock(&self.state.executed_requests).clone(),
            list_databases_calls: self.state.list_databases_calls.load(Ordering::SeqCst),
            close_calls: self.state.close_calls.load(Ordering::SeqCst),
        }
    }

    pub fn as_driver_arc(self) -> Arc<dyn DbDriver> {
        Arc::new(self)
    }

    fn next_connect_error(&self) -> Option<String> {
        if let Some(message) = rwlock_read(&self.state.connect_error).clone() {
            return Some(message);
        }

        self.state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()
            .map(|left| format!("transient connect failure ({left} left)"))
    }
}

impl DbDriver for FakeDriver {
    fn kind(&self) -> DbKind {
        self.kind
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.dialect
    }

    fn connect(&self, node: &ConnectionNode) -> Result<Box<dyn Connection>, DbError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        mutex_lock(&self.state.connected_nodes).push(node.clone());

        let delay = *rwlock_read(&self.state.connect_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        if let Some(message) = self.next_connect_error() {
            return Err(DbError::connection_failed(message));
        }

        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Box::new(FakeConnection {
            kind: self.kind,
            state: self.state.clone(),
            generation,
            closed: AtomicBool::new(false),
            current_database: RwLock::new(node.database.clone()),
        }))
    }
}

pub struct FakeConnection {
    kind: DbKind,
    state: Arc<FakeDriverState>,
    generation: usize,
    closed: AtomicBool,
    current_database: RwLock<Option<String>>,
}

impl Connection for FakeConnection {
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation > self.state.killed_through.load(Ordering::SeqCst)
    }

    fn ping(&self) -> Result<(), DbError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(DbError::connection_failed("connection is closed"))
        }
    }

    fn close(&self) -> Result<(), DbError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);

        match rwlock_read(&self.state.close_error).clone() {
            Some(message) => Err(DbError::connection_failed(message)),
            None => Ok(()),
        }
    }

    fn execute(&self, req: &QueryRequest) -> Result<QueryResult, DbError> {
        mutex_lock(&self.state.executed_requests).push(req.clone());

        // Like a real session, a request's own database is selected first.
        if let Some(database) = req.database.as_deref().filter(|db| !db.is_empty()) {
            *rwlock_write(&self.current_database) = Some(database.to_string());
        }

        let outcome = rwlock_read(&self.state.query_outcomes)
            .get(&req.sql)
            .cloned()
            .or_else(|| rwlock_read(&self.state.default_outcome).clone());

        if let Some(outcome) = outcome {
            return outcome.to_result();
        }

        if let Some(database) = req.sql.strip_prefix("USE ") {
            *rwlock_write(&self.current_database) = Some(database.trim_matches('`').to_string());
        }

        Ok(QueryResult::empty())
    }

    fn list_databases(&self) -> Result<Vec<DatabaseInfo>, DbError> {
        self.state.list_databases_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.current_database();

        Ok(rwlock_read(&self.state.databases)
            .iter()
            .map(|db| DatabaseInfo {
                name: db.name.clone(),
                is_current: current.as_deref() == Some(db.name.as_str()),
            })
            .collect())
    }

    fn current_database(&self) -> Option<String> {
        rwlock_read(&self.current_database).clone()
    }

    fn kind(&self) -> DbKind {
        self.kind
    }
}

pub(crate) fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

pub(crate) fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}
