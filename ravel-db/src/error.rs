use std::io;

/// Errors from the database client and pool.
#[derive(Debug)]
pub enum DbError {
    /// Socket-level failure.
    Io(io::Error),
    /// The server sent something we cannot frame or decode.
    Protocol(String),
    /// Authentication failed or the server demanded an unsupported mechanism.
    Auth(String),
    /// The server reported an error for a query.
    Server(String),
    /// The pool was closed while waiting for a connection.
    PoolClosed,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Io(e) => write!(f, "I/O error: {}", e),
            DbError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            DbError::Auth(msg) => write!(f, "authentication error: {}", msg),
            DbError::Server(msg) => write!(f, "server error: {}", msg),
            DbError::PoolClosed => write!(f, "connection pool is closed"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        DbError::Io(e)
    }
}

pub type DbResult<T> = Result<T, DbError>;
