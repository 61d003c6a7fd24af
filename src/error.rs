use crate::model::ModificationFailure;
use thiserror::Error;

pub mod sqlstate {
    pub const QUERY_CANCELED: &str = "57014";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const NO_TIME_LEFT: &str = "54000";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const UNTRANSLATABLE_CHARACTER: &str = "22P05";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const READ_ONLY_TRANSACTION: &str = "25006";
    /// Reported by drivers for failures that carry no server state.
    pub const NO_STATE: &str = "SNULL";
}

/// Error surfaced by a store collaborator, tagged with its SQLSTATE when known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    pub sqlstate: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
        }
    }

    pub fn without_state(message: impl Into<String>) -> Self {
        Self {
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn no_time_left() -> Self {
        Self::new(sqlstate::NO_TIME_LEFT, "No time left to execute query.")
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    pub fn has_state(&self, code: &str) -> bool {
        self.sqlstate()
            .is_some_and(|state| state.eq_ignore_ascii_case(code))
    }

    /// Signatures of infrastructure hiccups (serverless scale events, dropped
    /// connections) that are worth exactly one retry.
    pub fn is_transient(&self) -> bool {
        [
            sqlstate::QUERY_CANCELED,
            sqlstate::ADMIN_SHUTDOWN,
            sqlstate::CONNECTION_DOES_NOT_EXIST,
            sqlstate::CONNECTION_FAILURE,
        ]
        .iter()
        .any(|code| self.has_state(code))
    }

    pub fn is_undefined_table(&self) -> bool {
        self.has_state(sqlstate::UNDEFINED_TABLE)
    }

    pub fn is_out_of_time(&self) -> bool {
        self.has_state(sqlstate::NO_TIME_LEFT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    IllegalArgument,
    Conflict,
    Timeout,
    PayloadTooLarge,
    BadGateway,
    Exception,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::IllegalArgument => "ILLEGAL_ARGUMENT",
            ErrorClass::Conflict => "CONFLICT",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorClass::BadGateway => "BAD_GATEWAY",
            ErrorClass::Exception => "EXCEPTION",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum WriteError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        failed: Vec<ModificationFailure>,
    },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("bad gateway: {message}")]
    BadGateway {
        message: String,
        details: Option<String>,
    },
    #[error("exception: {0}")]
    Exception(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl WriteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WriteError::IllegalArgument(_) => ErrorClass::IllegalArgument,
            WriteError::Conflict { .. } => ErrorClass::Conflict,
            WriteError::Timeout(_) => ErrorClass::Timeout,
            WriteError::PayloadTooLarge(_) => ErrorClass::PayloadTooLarge,
            WriteError::BadGateway { .. } | WriteError::Transport(_) => ErrorClass::BadGateway,
            WriteError::Exception(_) => ErrorClass::Exception,
            WriteError::Store(err) => classify_store_error(err).class(),
        }
    }

    pub fn class_str(&self) -> &'static str {
        self.class().as_str()
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            WriteError::Store(err) => Some(err),
            _ => None,
        }
    }

    /// Replaces raw collaborator errors with their surfaced class.
    pub fn surface(self) -> WriteError {
        match self {
            WriteError::Store(err) => classify_store_error(&err),
            WriteError::Transport(message) => WriteError::BadGateway {
                message,
                details: None,
            },
            other => other,
        }
    }
}

/// Maps a raw store error onto the error class reported to the caller.
pub fn classify_store_error(err: &StoreError) -> WriteError {
    let message = err.message.as_str();
    match err.sqlstate().map(str::to_ascii_uppercase).as_deref() {
        Some(sqlstate::QUERY_CANCELED) | Some(sqlstate::ADMIN_SHUTDOWN) => {
            if message.contains("transform: couldn't project point") {
                return WriteError::IllegalArgument("projection error".into());
            }
            if message.contains("encode_geometry: 'GeometryCollection'") {
                return WriteError::IllegalArgument("dataset contains invalid geometries".into());
            }
            WriteError::Timeout("Database query timed out or got canceled.".into())
        }
        Some(sqlstate::NO_TIME_LEFT) => {
            WriteError::Timeout("No time for retry left for database query.".into())
        }
        Some(sqlstate::UNDEFINED_TABLE) => WriteError::Timeout(message.to_string()),
        Some(sqlstate::DEADLOCK_DETECTED) => WriteError::Conflict {
            message: message.to_string(),
            failed: Vec::new(),
        },
        Some(sqlstate::UNTRANSLATABLE_CHARACTER) => {
            WriteError::IllegalArgument("untranslatable character in payload".into())
        }
        Some(sqlstate::NO_STATE)
            if message.contains("attempt by a client to checkout a connection has timed out") =>
        {
            WriteError::Timeout("Cannot get a connection to the database.".into())
        }
        Some(sqlstate::NO_STATE) if message.contains("Maxchar limit") => {
            WriteError::PayloadTooLarge("Database result - Maxchar limit exceed".into())
        }
        _ => WriteError::Exception(message.to_string()),
    }
}
