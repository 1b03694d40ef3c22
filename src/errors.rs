//! `MonoError` — the single typed error channel crossing every layer of the
//! engine, per §7. Every variant carries a MongoDB-compatible `code`/
//! `codeName` pair so the command/wire boundary can project it straight to
//! the `{ok:0, errmsg, code, codeName}` envelope without re-deriving the
//! code elsewhere.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonoError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("checksum mismatch on page {page_id}")]
    ChecksumMismatch { page_id: u32 },

    #[error("WAL record corrupt at LSN {lsn}")]
    WalCorrupt { lsn: u64 },

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("duplicate key error collection: {ns} index: {index} dup key: {key_value}")]
    DuplicateKey { ns: String, index: String, key_value: String },

    #[error("document too large: {size} bytes exceeds {limit}")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("nesting depth exceeded: {depth} exceeds {limit}")]
    NestingTooDeep { depth: usize, limit: usize },

    #[error("invalid field name: {0}")]
    InvalidFieldName(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("no such transaction")]
    NoSuchTransaction,

    #[error("transaction already committed")]
    TransactionCommitted,

    #[error("transaction already aborted")]
    TransactionAborted,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cursor not found: {0}")]
    CursorNotFound(u64),
}

impl MonoError {
    /// The MongoDB-compatible numeric error code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Io(_) => 1,
            Self::InternalError(_) => 1,
            Self::ChecksumMismatch { .. } => 1,
            Self::WalCorrupt { .. } => 1,
            Self::NamespaceNotFound(_) => 26,
            Self::IndexNotFound(_) => 27,
            Self::DuplicateKey { .. } => 11000,
            Self::DocumentTooLarge { .. } => 17419,
            Self::NestingTooDeep { .. } => 17419,
            Self::InvalidFieldName(_) => 2,
            Self::CommandNotFound(_) => 59,
            Self::OperationFailed(_) => 96,
            Self::NoSuchTransaction => 251,
            Self::TransactionCommitted => 256,
            Self::TransactionAborted => 263,
            Self::ProtocolError(_) => 17,
            Self::InvalidArgument(_) => 2,
            Self::CursorNotFound(_) => 43,
        }
    }

    /// The MongoDB-compatible `codeName` string.
    #[must_use]
    pub const fn code_name(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::InternalError(_) | Self::ChecksumMismatch { .. } | Self::WalCorrupt { .. } => {
                "InternalError"
            }
            Self::NamespaceNotFound(_) => "NamespaceNotFound",
            Self::IndexNotFound(_) => "IndexNotFound",
            Self::DuplicateKey { .. } => "DuplicateKey",
            Self::DocumentTooLarge { .. } => "DocumentTooLarge",
            Self::NestingTooDeep { .. } => "DocumentTooLarge",
            Self::InvalidFieldName(_) => "BadValue",
            Self::CommandNotFound(_) => "CommandNotFound",
            Self::OperationFailed(_) => "OperationFailed",
            Self::NoSuchTransaction => "NoSuchTransaction",
            Self::TransactionCommitted => "TransactionCommitted",
            Self::TransactionAborted => "TransactionAborted",
            Self::ProtocolError(_) => "ProtocolError",
            Self::InvalidArgument(_) => "BadValue",
            Self::CursorNotFound(_) => "CursorNotFound",
        }
    }

    /// Render the MongoDB-compatible error envelope as a BSON document:
    /// `{ ok: 0, errmsg, code, codeName }`.
    #[must_use]
    pub fn to_envelope(&self) -> crate::bson::Document {
        let mut doc = crate::bson::Document::new();
        doc.insert("ok", crate::bson::Value::Double(0.0));
        doc.insert("errmsg", crate::bson::Value::String(self.to_string()));
        doc.insert("code", crate::bson::Value::Int32(self.code()));
        doc.insert("codeName", crate::bson::Value::String(self.code_name().to_string()));
        doc
    }
}

pub type MonoResult<T> = Result<T, MonoError>;

impl From<std::io::Error> for MonoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
