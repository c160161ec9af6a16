use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Failure reported by a data connection. The query pipeline never wraps or
/// retries these.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("command error: {0}")]
    Command(String),
    #[error("cannot bind {value} as parameter ${index} of type {pg_type}")]
    Parameter {
        index: usize,
        value: String,
        pg_type: String,
    },
}

/// Categorized error types for SQL command failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Error response from the database server, with the fields needed to
/// point at the failing part of a generated command.
#[derive(Debug, Clone, Error)]
#[error("{category}: {message}")]
pub struct DatabaseError {
    pub category: ErrorCategory,
    /// SQLSTATE error code (e.g., "42601" for syntax_error)
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based byte offset into the command text
    pub position: Option<u32>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    /// Line and column (both 1-based) computed from `position`
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl DatabaseError {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            category: categorize_sqlstate(code),
            code: code.to_string(),
            message: message.to_string(),
            detail: None,
            hint: None,
            position: None,
            table: None,
            column: None,
            constraint: None,
            line: None,
            col: None,
        }
    }
}

impl ExecutionError {
    /// Convert a tokio_postgres error, using the command text to compute
    /// line/column from the reported byte position.
    pub fn from_pg_error(err: &tokio_postgres::Error, command: &str) -> Self {
        let Some(db_err) = err.as_db_error() else {
            // Non-database error (connection, protocol, etc.)
            return match err.source() {
                Some(source) => ExecutionError::Connection(format!("{}: {}", err, source)),
                None => ExecutionError::Connection(err.to_string()),
            };
        };

        let position = db_err.position().and_then(|p| match p {
            tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
            tokio_postgres::error::ErrorPosition::Internal { .. } => None,
        });
        let (line, col) = match position {
            Some(pos) => byte_offset_to_line_col(command, pos as usize),
            None => (None, None),
        };

        let mut error = DatabaseError::new(db_err.code().code(), db_err.message());
        error.detail = db_err.detail().map(|s| s.to_string());
        error.hint = db_err.hint().map(|s| s.to_string());
        error.position = position;
        error.table = db_err.table().map(|s| s.to_string());
        error.column = db_err.column().map(|s| s.to_string());
        error.constraint = db_err.constraint().map(|s| s.to_string());
        error.line = line;
        error.col = col;
        ExecutionError::Database(error)
    }
}

/// Convert a 1-based byte offset in a command string to (line, column) both 1-based.
fn byte_offset_to_line_col(command: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || command.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(command.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in command.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error; the rest of class 42 is undefined objects etc.
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}
