use std::fmt;
use std::io;

use sblock_core::BlockError;
use sblock_shmem::ShmemError;
use sblock_signal::SignalError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn shmem_error(context: &str, err: ShmemError) -> CliError {
    match err {
        ShmemError::Map { source, .. } => io_error(context, source),
        ShmemError::ZeroSize | ShmemError::Exhausted { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn signal_error(context: &str, err: SignalError) -> CliError {
    match err {
        SignalError::Io(source) => io_error(context, source),
        SignalError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn block_error(context: &str, err: BlockError) -> CliError {
    match err {
        BlockError::Shmem(err) => shmem_error(context, err),
        BlockError::Signal(err) => signal_error(context, err),
        BlockError::Spawn(source) => io_error(context, source),
        BlockError::DeadlineExceeded(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BlockError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        BlockError::InvalidBlock(_) | BlockError::LayoutMismatch(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        BlockError::NotReady | BlockError::TornDown | BlockError::NotFound { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
