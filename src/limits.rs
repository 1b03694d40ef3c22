//! Resource limits enforced across the engine, centralized per §6 of the
//! specification so every call site references one source of truth.

/// Maximum serialized document size (16 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
/// Maximum nested document/array depth.
pub const MAX_NESTING_DEPTH: usize = 100;
/// Maximum UTF-8 byte length of a field name.
pub const MAX_FIELD_NAME_LEN: usize = 1024;
/// Maximum byte length of a `database.collection` namespace string.
pub const MAX_NS_LEN: usize = 255;
/// Maximum number of indexes per collection.
pub const MAX_INDEXES_PER_COLLECTION: usize = 64;
/// Maximum number of fields in a compound index key spec.
pub const MAX_COMPOUND_INDEX_FIELDS: usize = 32;
/// Maximum number of documents in a single batch write.
pub const MAX_BATCH_WRITE: usize = 100_000;
/// Maximum number of elements in a BSON array.
pub const MAX_ARRAY_LENGTH: usize = 1_000_000;
/// Default cursor batch size for `find`/`aggregate` first batches.
pub const DEFAULT_CURSOR_BATCH: usize = 101;
/// Idle cursor timeout.
pub const CURSOR_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);
/// Idle session timeout.
pub const SESSION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);
/// Default lock acquisition timeout.
pub const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Page size on disk (4 KiB).
pub const PAGE_SIZE: usize = 4096;
/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;
/// Usable payload bytes per page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
/// `FileHeader` size in bytes.
pub const FILE_HEADER_SIZE: usize = 64;
