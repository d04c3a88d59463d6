//! Page store error types
//!
//! Error codes:
//! - PAGE_IO_ERROR (ERROR severity)
//! - PAGE_OUT_OF_SPACE (ERROR severity)
//! - PAGE_DATA_CORRUPTION (FATAL severity)
//! - PAGE_ILLEGAL_STATE (ERROR severity)
//! - PAGE_OPTIMISTIC_CONFLICT (RETRY severity)
//!
//! Propagation policy: conflicts and out-of-space are returned to the
//! immediate caller for local handling (retry loop / file growth).
//! Corruption aborts startup entirely. Illegal state is a programming
//! error and is never retried.

use std::fmt;
use std::io;

/// Severity levels for page store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The transaction must be rolled back and retried
    Retry,
    /// Operation fails, the store continues
    Error,
    /// The store must not continue
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Retry => write!(f, "RETRY"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Page store error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingErrorCode {
    /// Disk I/O failure
    PageIoError,
    /// The allocator has no sufficiently large free range
    PageOutOfSpace,
    /// Checksum failure or unparseable on-disk record
    PageDataCorruption,
    /// API misuse (closed transaction, clear of a page never put, ...)
    PageIllegalState,
    /// A conflicting commit landed after this transaction's snapshot
    PageOptimisticConflict,
}

impl PagingErrorCode {
    /// Returns the string code.
    pub fn code(&self) -> &'static str {
        match self {
            PagingErrorCode::PageIoError => "PAGE_IO_ERROR",
            PagingErrorCode::PageOutOfSpace => "PAGE_OUT_OF_SPACE",
            PagingErrorCode::PageDataCorruption => "PAGE_DATA_CORRUPTION",
            PagingErrorCode::PageIllegalState => "PAGE_ILLEGAL_STATE",
            PagingErrorCode::PageOptimisticConflict => "PAGE_OPTIMISTIC_CONFLICT",
        }
    }

    /// Returns the severity level for this error.
    pub fn severity(&self) -> Severity {
        match self {
            PagingErrorCode::PageIoError => Severity::Error,
            PagingErrorCode::PageOutOfSpace => Severity::Error,
            PagingErrorCode::PageDataCorruption => Severity::Fatal,
            PagingErrorCode::PageIllegalState => Severity::Error,
            PagingErrorCode::PageOptimisticConflict => Severity::Retry,
        }
    }
}

impl fmt::Display for PagingErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Page store error with full context.
#[derive(Debug)]
pub struct PagingError {
    /// Error code
    code: PagingErrorCode,
    /// Human-readable message
    message: String,
    /// Optional details about the error context
    details: Option<String>,
    /// Underlying IO error if applicable
    source: Option<io::Error>,
}

impl PagingError {
    /// Create a new I/O error.
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: PagingErrorCode::PageIoError,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    /// Create an out-of-space error.
    pub fn out_of_space(requested: u32) -> Self {
        Self {
            code: PagingErrorCode::PageOutOfSpace,
            message: "no free range large enough".to_string(),
            details: Some(format!("requested_pages: {}", requested)),
            source: None,
        }
    }

    /// Create a data corruption error (FATAL).
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self {
            code: PagingErrorCode::PageDataCorruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create a data corruption error with page id context.
    pub fn corruption_at_page(page: u32, reason: impl Into<String>) -> Self {
        Self {
            code: PagingErrorCode::PageDataCorruption,
            message: reason.into(),
            details: Some(format!("page: {}", page)),
            source: None,
        }
    }

    /// Create an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self {
            code: PagingErrorCode::PageIllegalState,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create an optimistic conflict error for the given page.
    pub fn optimistic_conflict(page: u32) -> Self {
        Self {
            code: PagingErrorCode::PageOptimisticConflict,
            message: "page was modified by a later commit".to_string(),
            details: Some(format!("page: {}", page)),
            source: None,
        }
    }

    /// Returns the error code.
    pub fn code(&self) -> PagingErrorCode {
        self.code
    }

    /// Returns the severity level.
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this is an optimistic conflict (roll back and retry).
    pub fn is_conflict(&self) -> bool {
        self.code == PagingErrorCode::PageOptimisticConflict
    }

    /// Returns whether this error is fatal (the store must not continue).
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for PagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for page store operations.
pub type PagingResult<T> = Result<T, PagingError>;
