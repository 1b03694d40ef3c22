#![forbid(unsafe_code)]

pub mod aggregation;
pub mod bson;
pub mod btree;
pub mod catalog;
pub mod collection;
pub mod command;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod errors;
pub mod keystring;
pub mod limits;
pub mod lock;
pub mod logger;
pub mod session;
pub mod storage;
pub mod txn;
pub mod wal;
pub mod wire;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use command::CommandRouter;
use engine::Engine;
use errors::MonoResult;

/// The embeddable database handle: owns the engine and the command
/// router that sits in front of it. `run_command` is the single entry
/// point a host (an in-process caller, or eventually the wire listener)
/// drives every operation through.
pub struct Database {
    engine: Arc<Engine>,
    router: CommandRouter,
}

impl Database {
    /// Opens (or creates) the single-file database at `path`.
    ///
    /// # Errors
    /// Returns an error if the underlying file cannot be opened or its
    /// catalog fails to validate.
    pub fn open(path: impl AsRef<Path>) -> MonoResult<Self> {
        let engine = Arc::new(Engine::open(path)?);
        let router = CommandRouter::new(engine.clone());
        Ok(Self { engine, router })
    }

    /// Opens the database described by `config`, initializing logging
    /// into a `{stem}_logs` directory next to the data file first.
    ///
    /// # Errors
    /// Returns an error if the underlying file cannot be opened.
    pub fn open_with_config(config: &config::Config) -> MonoResult<Self> {
        if let Some(stem) = config.data_path.file_stem().and_then(|s| s.to_str()) {
            let base = config.data_path.parent().unwrap_or_else(|| Path::new("."));
            let _ = logger::init_for_db_in(base, stem);
        }
        Self::open(&config.data_path)
    }

    /// Runs a single MongoDB-style command document against database
    /// `db` and returns its BSON reply (including `{ok: 0, ...}` on
    /// failure — this call itself never fails).
    pub async fn run_command(&self, db: &str, command: &Document) -> Document {
        self.router.dispatch(db, command).await
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Periodic maintenance: evicts idle cursors and sessions, aborting
    /// any transaction an expired session left active (§5). A host
    /// should call this on a timer; nothing does it automatically.
    pub fn sweep_expired(&self) {
        for txn in self.engine.sessions.sweep_expired() {
            let _ = self.engine.abort_transaction(&txn);
        }
        self.engine.cursors.sweep_expired();
    }

    /// Flushes the pager, fsyncing every dirty page to disk.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> MonoResult<()> {
        self.engine.flush()
    }
}

/// Convenience wrapper used by callers that want a single fire-and-forget
/// timeout for a lock acquisition outside of any command (e.g. tooling);
/// command dispatch uses `config::Config::lock_timeout` directly.
#[must_use]
pub fn default_lock_timeout() -> Duration {
    limits::LOCK_TIMEOUT
}
