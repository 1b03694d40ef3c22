//! Write-ahead log: durable record of intended page mutations, written
//! before the corresponding data page (§3, §4.8).

pub mod log;
pub mod record;

pub use log::Wal;
pub use record::{RecordKind, WalRecord};
