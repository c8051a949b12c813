use std::io;

/// Central error type for the ravel engine.
#[derive(Debug)]
pub enum RavelError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Startup failed: socket, self-pipe, mux registration or database pool.
    Setup(String),
    /// The worker pool queue is at capacity.
    QueueFull,
}

impl std::fmt::Display for RavelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RavelError::Io(e) => write!(f, "I/O error: {}", e),
            RavelError::Setup(msg) => write!(f, "setup error: {}", msg),
            RavelError::QueueFull => write!(f, "worker queue is full"),
        }
    }
}

impl std::error::Error for RavelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RavelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RavelError {
    fn from(e: io::Error) -> Self {
        RavelError::Io(e)
    }
}

pub type RavelResult<T> = Result<T, RavelError>;
