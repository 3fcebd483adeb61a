//! Error codes and results for backup-engine operations
//!
//! Codes are numerically stable: they appear in error-log files and cross the
//! plugin boundary, so renumbering is a wire-format change. Negative values
//! mean failure.

use std::fmt;

/// Stable error code for backup-engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Invalid argument (out-of-range id, malformed input)
    InvalidParam = -1,
    /// Component initialization failed
    InitFailed = -2,
    /// API call before `init`
    NotInitialized = -3,
    /// Allocation failure or a configured capacity was exceeded
    OutOfMemory = -4,
    /// File open/read/write/stat failure
    FileIo = -5,
    /// Connection or transport failure
    Network = -6,
    /// Operation exceeded its deadline
    Timeout = -7,
    /// CRC mismatch or wrong header magic
    DataCorruption = -8,
    /// The OS refused the operation
    PermissionDenied = -9,
    /// No space left on device
    DiskFull = -10,
    /// Transport dropped mid-stream
    ConnectionLost = -11,
    /// The retry loop gave up
    RetryExhausted = -12,
    /// Block state transition forbidden by the transition matrix
    InvalidStateTransition = -13,
    /// Block id absent from the metadata map
    BlockNotFound = -14,
    /// Unclassified failure
    Unknown = -99,
}

impl ErrorCode {
    /// Check whether the code indicates success.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, ErrorCode::Ok)
    }

    /// Check whether a failed operation with this code may be re-attempted.
    ///
    /// The retryable set is exactly {FileIo, Network, Timeout,
    /// ConnectionLost}: failures whose cause is expected to be transient.
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::FileIo | ErrorCode::Network | ErrorCode::Timeout | ErrorCode::ConnectionLost
        )
    }

    /// Numeric value as recorded in error logs.
    #[inline]
    pub const fn code(&self) -> i32 {
        *self as i32
    }

    /// Get the code as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "Ok",
            ErrorCode::InvalidParam => "InvalidParam",
            ErrorCode::InitFailed => "InitFailed",
            ErrorCode::NotInitialized => "NotInitialized",
            ErrorCode::OutOfMemory => "OutOfMemory",
            ErrorCode::FileIo => "FileIo",
            ErrorCode::Network => "Network",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::DataCorruption => "DataCorruption",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::DiskFull => "DiskFull",
            ErrorCode::ConnectionLost => "ConnectionLost",
            ErrorCode::RetryExhausted => "RetryExhausted",
            ErrorCode::InvalidStateTransition => "InvalidStateTransition",
            ErrorCode::BlockNotFound => "BlockNotFound",
            ErrorCode::Unknown => "Unknown",
        }
    }

    /// Default human-readable message for the code.
    pub const fn message(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::InvalidParam => "Invalid parameter",
            ErrorCode::InitFailed => "Initialization failed",
            ErrorCode::NotInitialized => "Not initialized",
            ErrorCode::OutOfMemory => "Memory allocation failed",
            ErrorCode::FileIo => "File I/O error",
            ErrorCode::Network => "Network error",
            ErrorCode::Timeout => "Operation timeout",
            ErrorCode::DataCorruption => "Data corruption detected",
            ErrorCode::PermissionDenied => "Permission denied",
            ErrorCode::DiskFull => "Disk full",
            ErrorCode::ConnectionLost => "Connection lost",
            ErrorCode::RetryExhausted => "Retry attempts exhausted",
            ErrorCode::InvalidStateTransition => "Invalid block state transition",
            ErrorCode::BlockNotFound => "Block not found",
            ErrorCode::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by backup-engine operations: a stable code plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    /// Create an error with an explicit message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an error carrying the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
        }
    }

    /// The stable error code.
    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The message recorded with the error.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure may be re-attempted.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::from_code(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => ErrorCode::ConnectionLost,
            ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            _ => ErrorCode::FileIo,
        };
        Error::new(code, err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
