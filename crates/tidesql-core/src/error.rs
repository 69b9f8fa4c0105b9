//! Error types for TideSQL operations.

use std::fmt;

/// The primary error type for all TideSQL operations.
#[derive(Debug)]
pub enum Error {
    /// Opening or configuring a connection failed
    Connection(ConnectionError),
    /// The engine rejected or failed a statement
    Sql(SqlError),
    /// Lock contention (engine busy/locked, or no lease within the timeout)
    Busy(BusyError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction and savepoint misuse
    Transaction(TransactionError),
    /// Handle used after invalidation or outside its protocol
    Handle(HandleError),
    /// Migration registration or progress errors
    Migration(MigrationError),
    /// The database file failed an integrity check
    Corruption(CorruptionError),
    /// Configuration pipeline errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation was interrupted through a cancellation signal
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub path: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// `sqlite3_open_v2` failed
    Open,
    /// A config step failed while building the handle
    Configure,
    /// The database is closed or closing
    Closed,
}

#[derive(Debug)]
pub struct SqlError {
    pub kind: SqlErrorKind,
    /// Primary engine result code.
    pub code: i32,
    /// Extended engine result code.
    pub extended_code: i32,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// Syntax error or unknown object
    Syntax,
    /// Constraint violation (unique, foreign key, check, not null)
    Constraint,
    /// Permission or authorization denied
    Permission,
    /// Write attempted on a read-only database
    ReadOnly,
    /// Value or statement too large
    TooBig,
    /// Database image is malformed or not a database
    Corrupt,
    /// Disk or quota full
    Full,
    /// Schema changed under a prepared statement
    Schema,
    /// API used out of protocol
    Misuse,
    /// Other engine error
    Database,
}

#[derive(Debug)]
pub struct BusyError {
    pub kind: BusyKind,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    /// SQLITE_BUSY
    Busy,
    /// SQLITE_LOCKED
    Locked,
    /// No write or exclusive lease became available in time
    PoolTimeout,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without an open transaction
    NotInTransaction,
    /// Begin while a transaction is already open
    AlreadyInTransaction,
    /// Savepoint name is not active
    SavepointNotFound,
}

#[derive(Debug)]
pub struct HandleError {
    pub kind: HandleErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleErrorKind {
    /// The handle was invalidated and its connection closed
    Invalidated,
    /// Operation not valid in the statement's current state
    Misuse,
    /// Column or parameter index out of range
    OutOfRange,
}

#[derive(Debug)]
pub struct MigrationError {
    pub kind: MigrationErrorKind,
    pub table: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorKind {
    /// The source table is missing or unusable
    InvalidSource,
    /// Source and target schemas are incompatible
    Incompatible,
    /// The statement cannot be expressed against a migrating table
    Unsupported,
    /// The mapping stopped advancing after a non-transient failure
    Paused,
    /// A table is already registered for migration
    AlreadyRegistered,
}

#[derive(Debug)]
pub struct CorruptionError {
    pub path: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub name: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a transient lock conflict that a retry may resolve?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Does this error indicate a damaged database file?
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Sql(e) => e.kind == SqlErrorKind::Corrupt,
            Error::Corruption(_) => true,
            // A handle whose set-up hit a damaged file
            Error::Connection(e) => e
                .source
                .as_deref()
                .and_then(|source| source.downcast_ref::<Error>())
                .is_some_and(Error::is_corruption),
            _ => false,
        }
    }

    /// Is this a constraint violation?
    pub fn is_constraint(&self) -> bool {
        matches!(self, Error::Sql(e) if e.kind == SqlErrorKind::Constraint)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Sql(e) => e.sql.as_deref(),
            Error::Busy(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    /// Primary engine result code, if this error came from the engine.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Sql(e) => Some(e.code),
            _ => None,
        }
    }

    /// Shorthand for an invalidated-handle error.
    pub fn invalidated(message: impl Into<String>) -> Self {
        Error::Handle(HandleError {
            kind: HandleErrorKind::Invalidated,
            message: message.into(),
        })
    }

    /// Shorthand for a handle misuse error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Error::Handle(HandleError {
            kind: HandleErrorKind::Misuse,
            message: message.into(),
        })
    }

    /// Shorthand for a pool lease timeout.
    pub fn pool_timeout(message: impl Into<String>) -> Self {
        Error::Busy(BusyError {
            kind: BusyKind::PoolTimeout,
            message: message.into(),
            sql: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error on '{}': {}", e.path, e.message),
            Error::Sql(e) => write!(f, "SQL error ({}): {}", e.extended_code, e.message),
            Error::Busy(e) => write!(f, "Busy: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Handle(e) => write!(f, "Handle error: {}", e.message),
            Error::Migration(e) => write!(f, "Migration error on '{}': {}", e.table, e.message),
            Error::Corruption(e) => write!(f, "Database '{}' is corrupted: {}", e.path, e.message),
            Error::Config(e) => match &e.name {
                Some(name) => write!(f, "Configuration error in '{}': {}", name, e.message),
                None => write!(f, "Configuration error: {}", e.message),
            },
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Migration(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql {
            Some(sql) => write!(f, "{} (in `{}`)", self.message, sql),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<SqlError> for Error {
    fn from(err: SqlError) -> Self {
        Error::Sql(err)
    }
}

impl From<BusyError> for Error {
    fn from(err: BusyError) -> Self {
        Error::Busy(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<HandleError> for Error {
    fn from(err: HandleError) -> Self {
        Error::Handle(err)
    }
}

impl From<MigrationError> for Error {
    fn from(err: MigrationError) -> Self {
        Error::Migration(err)
    }
}

impl From<CorruptionError> for Error {
    fn from(err: CorruptionError) -> Self {
        Error::Corruption(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for TideSQL operations.
pub type Result<T> = std::result::Result<T, Error>;
