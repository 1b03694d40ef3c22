//! Command dispatch (§4.11, §6): turns a parsed command document into a
//! BSON reply. Extracts session/transaction context, acquires a resource
//! lock for the call's duration (the session's transaction if one is
//! active, an implicit single-statement transaction otherwise), and
//! routes to the engine. Unknown commands, and anything the engine
//! rejects, come back as the `{ok: 0, errmsg, code, codeName}` envelope.

use std::sync::Arc;

use crate::bson::{Document, ObjectId, Value};
use crate::engine::Engine;
use crate::errors::{MonoError, MonoResult};
use crate::keystring::KeyField;
use crate::limits::{DEFAULT_CURSOR_BATCH, LOCK_TIMEOUT, MAX_BATCH_WRITE};
use crate::lock::LockMode;
use crate::session::{extract_command_context, CommandContext};
use crate::txn::Txn;

include!(concat!(env!("OUT_DIR"), "/compiled_features.rs"));

pub struct CommandRouter {
    engine: Arc<Engine>,
}

impl CommandRouter {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Runs `command` against database `db`, never panicking or
    /// returning an error out of band: every failure is folded into the
    /// `{ok: 0, ...}` envelope so the wire layer always has a document
    /// to reply with.
    pub async fn dispatch(&self, db: &str, command: &Document) -> Document {
        match self.try_dispatch(db, command).await {
            Ok(doc) => doc,
            Err(err) => enrich_error(&self.engine, &err, None),
        }
    }

    async fn try_dispatch(&self, db: &str, command: &Document) -> MonoResult<Document> {
        let (name, _) = command.iter().next().ok_or_else(|| MonoError::CommandNotFound(String::new()))?;
        let name = name.to_string();
        let ctx = extract_command_context(command);
        if let Some(lsid) = &ctx.lsid {
            self.engine.sessions.touch(lsid);
        }

        match name.as_str() {
            "hello" | "isMaster" => Ok(self.hello()),
            "ping" => Ok(ok_doc()),
            "buildInfo" => Ok(self.build_info()),
            "serverStatus" => Ok(self.server_status()),
            "dbStats" => Ok(self.db_stats(db)),
            "collStats" => self.coll_stats(command),
            "listCollections" => Ok(self.list_collections(db)),
            "listIndexes" => self.list_indexes(command),
            "create" => self.create(command),
            "drop" => self.drop_collection(command),
            "createIndexes" => self.create_indexes(command),
            "dropIndexes" => self.drop_indexes(command),
            "insert" => self.insert(db, command, &ctx).await,
            "find" => self.find(db, command, &ctx).await,
            "getMore" => self.get_more(command),
            "killCursors" => self.kill_cursors(command),
            "update" => self.update(db, command, &ctx).await,
            "delete" => self.delete(db, command, &ctx).await,
            "findAndModify" => self.find_and_modify(db, command, &ctx).await,
            "distinct" => self.distinct(db, command, &ctx).await,
            "count" => self.count(db, command, &ctx).await,
            "aggregate" => self.aggregate(db, command, &ctx).await,
            "explain" => self.explain(command),
            "validate" => self.validate(command),
            "startSession" => Ok(self.start_session()),
            "endSessions" => Ok(self.end_sessions(command)),
            "refreshSessions" => Ok(self.refresh_sessions(command)),
            "startTransaction" => self.start_transaction(&ctx),
            "commitTransaction" => self.commit_transaction(&ctx),
            "abortTransaction" => self.abort_transaction(&ctx),
            other => Err(MonoError::CommandNotFound(other.to_string())),
        }
    }

    // -- Administrative / handshake commands --------------------------

    fn hello(&self) -> Document {
        let mut reply = ok_doc();
        reply.insert("ismaster", Value::Boolean(true));
        reply.insert("maxWireVersion", Value::Int32(17));
        reply.insert("maxBsonObjectSize", Value::Int32(crate::limits::MAX_DOCUMENT_SIZE as i32));
        reply.insert("maxWriteBatchSize", Value::Int32(MAX_BATCH_WRITE as i32));
        reply.insert("readOnly", Value::Boolean(false));
        reply
    }

    fn build_info(&self) -> Document {
        let mut reply = ok_doc();
        reply.insert("version", Value::String(env!("CARGO_PKG_VERSION").to_string()));
        reply.insert("bits", Value::Int32(64));
        let modules = COMPILED_FEATURES.iter().map(|s| Value::String((*s).to_string())).collect();
        reply.insert("modules", Value::Array(modules));
        reply
    }

    fn server_status(&self) -> Document {
        let mut reply = ok_doc();
        reply.insert("host", Value::String("monolite".to_string()));
        reply.insert("pid", Value::Int64(std::process::id() as i64));
        reply
    }

    fn db_stats(&self, db: &str) -> Document {
        let mut reply = ok_doc();
        reply.insert("db", Value::String(db.to_string()));
        reply.insert("collections", Value::Int32(self.engine.list_collection_names().len() as i32));
        reply
    }

    fn coll_stats(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "collStats")?;
        let count = self.engine.count(&ns, &Document::new())?;
        let mut reply = ok_doc();
        reply.insert("ns", Value::String(ns));
        reply.insert("count", Value::Int32(count as i32));
        Ok(reply)
    }

    fn list_collections(&self, db: &str) -> Document {
        let batch: Vec<Value> = self
            .engine
            .list_collection_names()
            .into_iter()
            .map(|name| {
                let mut entry = Document::new();
                entry.insert("name", Value::String(name));
                entry.insert("type", Value::String("collection".to_string()));
                Value::Document(entry)
            })
            .collect();
        let mut cursor = Document::new();
        cursor.insert("id", Value::Int64(0));
        cursor.insert("ns", Value::String(format!("{db}.$cmd.listCollections")));
        cursor.insert("firstBatch", Value::Array(batch));
        let mut reply = ok_doc();
        reply.insert("cursor", Value::Document(cursor));
        reply
    }

    fn list_indexes(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "listIndexes")?;
        let indexes = self.engine.list_indexes(&ns)?;
        let batch: Vec<Value> = indexes.into_iter().map(index_entry_to_document).collect();
        let mut cursor = Document::new();
        cursor.insert("id", Value::Int64(0));
        cursor.insert("ns", Value::String(ns));
        cursor.insert("firstBatch", Value::Array(batch));
        let mut reply = ok_doc();
        reply.insert("cursor", Value::Document(cursor));
        Ok(reply)
    }

    // -- DDL ------------------------------------------------------------

    fn create(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "create")?;
        self.engine.create_collection(&ns)?;
        Ok(ok_doc())
    }

    fn drop_collection(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "drop")?;
        self.engine.drop_collection(&ns)?;
        Ok(ok_doc())
    }

    fn create_indexes(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "createIndexes")?;
        let Some(Value::Array(specs)) = command.get("indexes") else {
            return Err(MonoError::InvalidArgument("createIndexes requires an indexes array".into()));
        };
        let mut created = 0i32;
        for spec in specs {
            let Value::Document(spec) = spec else {
                return Err(MonoError::InvalidArgument("each index spec must be a document".into()));
            };
            let Some(Value::Document(key_doc)) = spec.get("key") else {
                return Err(MonoError::InvalidArgument("index spec requires a key document".into()));
            };
            let key = parse_key_spec(key_doc)?;
            let unique = matches!(spec.get("unique"), Some(Value::Boolean(true)));
            let name = match spec.get("name") {
                Some(Value::String(s)) => s.clone(),
                _ => default_index_name(&key),
            };
            self.engine.create_index(&ns, key, unique, name)?;
            created += 1;
        }
        let mut reply = ok_doc();
        reply.insert("numIndexesAfter", Value::Int32(created));
        Ok(reply)
    }

    fn drop_indexes(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "dropIndexes")?;
        let name = match command.get("index") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(MonoError::InvalidArgument("dropIndexes requires an index name".into())),
        };
        self.engine.drop_index(&ns, &name)?;
        Ok(ok_doc())
    }

    fn validate(&self, command: &Document) -> MonoResult<Document> {
        let ns = target_collection(command, "validate")?;
        let indexes = self.engine.list_indexes(&ns)?;
        let mut reply = ok_doc();
        reply.insert("ns", Value::String(ns));
        match self.engine.validate_catalog() {
            Ok(()) => {
                reply.insert("valid", Value::Boolean(true));
            }
            Err(err) => {
                reply.insert("valid", Value::Boolean(false));
                reply.insert("errors", Value::Array(vec![Value::String(err.to_string())]));
            }
        }
        reply.insert("nIndexes", Value::Int32(indexes.len() as i32));
        Ok(reply)
    }

    fn explain(&self, command: &Document) -> MonoResult<Document> {
        let Some(Value::Document(inner)) = command.get("explain") else {
            return Err(MonoError::InvalidArgument("explain requires an embedded command document".into()));
        };
        let (inner_name, _) = inner.iter().next().ok_or_else(|| MonoError::InvalidArgument("empty explain target".into()))?;
        let mut planner = Document::new();
        planner.insert("parsedQuery", inner.get("filter").cloned().unwrap_or_else(|| Value::Document(Document::new())));
        planner.insert("namespace", inner.get(inner_name).cloned().unwrap_or(Value::Null));
        let mut reply = ok_doc();
        reply.insert("queryPlanner", Value::Document(planner));
        Ok(reply)
    }

    // -- CRUD -------------------------------------------------------------

    async fn insert(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "insert")?;
        let ns = namespace(db, &coll);
        let Some(Value::Array(items)) = command.get("documents") else {
            return Err(MonoError::InvalidArgument("insert requires a documents array".into()));
        };
        if items.len() > MAX_BATCH_WRITE {
            return Err(MonoError::InvalidArgument(format!("batch of {} exceeds the {MAX_BATCH_WRITE} document limit", items.len())));
        }
        let docs: Vec<Document> = items
            .iter()
            .map(|v| match v {
                Value::Document(d) => Ok(d.clone()),
                _ => Err(MonoError::InvalidArgument("insert documents must be BSON documents".into())),
            })
            .collect::<MonoResult<_>>()?;
        let originals = docs.clone();

        self.with_write(&ns, ctx, |txn| {
            let (inserted, errs) = self.engine.insert_many(&coll, docs, txn)?;
            let mut reply = ok_doc();
            reply.insert("n", Value::Int32(inserted.len() as i32));
            if !errs.is_empty() {
                let write_errors: Vec<Value> = errs
                    .into_iter()
                    .map(|(index, err)| {
                        let mut envelope = enrich_error(&self.engine, &err, originals.get(index));
                        envelope.insert("index", Value::Int32(index as i32));
                        Value::Document(envelope)
                    })
                    .collect();
                reply.insert("writeErrors", Value::Array(write_errors));
            }
            Ok(reply)
        })
        .await
    }

    async fn find(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "find")?;
        let ns = namespace(db, &coll);
        let filter = as_document(command.get("filter")).unwrap_or_default();
        let sort = as_document(command.get("sort"));
        let skip = as_usize(command.get("skip")).unwrap_or(0);
        let limit = as_usize(command.get("limit"));
        let batch_size = as_usize(command.get("batchSize")).unwrap_or(DEFAULT_CURSOR_BATCH);

        self.with_read(&ns, ctx, || {
            let docs = self.engine.find(&coll, &filter, sort.as_ref(), skip, limit)?;
            let (cursor_id, first_batch) = self.engine.cursors.open(namespace(db, &coll), docs.into(), batch_size);
            Ok(cursor_reply(cursor_id, namespace(db, &coll), "firstBatch", first_batch))
        })
        .await
    }

    fn get_more(&self, command: &Document) -> MonoResult<Document> {
        let cursor_id = match command.get("getMore") {
            Some(Value::Int64(n)) => *n as u64,
            Some(Value::Int32(n)) => *n as u64,
            _ => return Err(MonoError::InvalidArgument("getMore requires a cursor id".into())),
        };
        let ns = match command.get("collection") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(MonoError::InvalidArgument("getMore requires a collection name".into())),
        };
        let batch_size = as_usize(command.get("batchSize")).unwrap_or(DEFAULT_CURSOR_BATCH);
        let (batch, next_id) = self.engine.cursors.get_more(cursor_id, &ns, batch_size)?;
        Ok(cursor_reply(next_id, ns, "nextBatch", batch))
    }

    fn kill_cursors(&self, command: &Document) -> MonoResult<Document> {
        let Some(Value::Array(ids)) = command.get("cursors") else {
            return Err(MonoError::InvalidArgument("killCursors requires a cursors array".into()));
        };
        let requested: Vec<u64> = ids
            .iter()
            .filter_map(|v| match v {
                Value::Int64(n) => Some(*n as u64),
                Value::Int32(n) => Some(*n as u64),
                _ => None,
            })
            .collect();
        let killed = self.engine.cursors.kill(&requested);
        let not_found: Vec<Value> =
            requested.iter().filter(|id| !killed.contains(id)).map(|id| Value::Int64(*id as i64)).collect();
        let mut reply = ok_doc();
        reply.insert("cursorsKilled", Value::Array(killed.into_iter().map(|id| Value::Int64(id as i64)).collect()));
        reply.insert("cursorsNotFound", Value::Array(not_found));
        Ok(reply)
    }

    async fn update(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "update")?;
        let ns = namespace(db, &coll);
        let Some(Value::Array(statements)) = command.get("updates") else {
            return Err(MonoError::InvalidArgument("update requires an updates array".into()));
        };
        let statements = statements.clone();

        self.with_write(&ns, ctx, |txn| {
            let mut matched = 0i32;
            let mut modified = 0i32;
            let mut upserted: Vec<Value> = Vec::new();
            for (index, statement) in statements.iter().enumerate() {
                let Value::Document(stmt) = statement else {
                    return Err(MonoError::InvalidArgument(format!("update statement {index} must be a document")));
                };
                let query = as_document(stmt.get("q")).unwrap_or_default();
                let Some(Value::Document(update_doc)) = stmt.get("u") else {
                    return Err(MonoError::InvalidArgument(format!("update statement {index} requires u")));
                };
                let multi = matches!(stmt.get("multi"), Some(Value::Boolean(true)));
                let upsert = matches!(stmt.get("upsert"), Some(Value::Boolean(true)));

                let target_query = if multi { query.clone() } else { self.narrow_to_first_match(&coll, &query)?.unwrap_or(query) };
                let outcome = self.engine.update_many(&coll, &target_query, update_doc, upsert, txn)?;
                matched += outcome.matched as i32;
                modified += outcome.modified as i32;
                if let Some(id) = outcome.upserted_id {
                    let mut entry = Document::new();
                    entry.insert("index", Value::Int32(index as i32));
                    entry.insert("_id", id);
                    upserted.push(Value::Document(entry));
                }
            }
            let mut reply = ok_doc();
            reply.insert("n", Value::Int32(matched));
            reply.insert("nModified", Value::Int32(modified));
            if !upserted.is_empty() {
                reply.insert("upserted", Value::Array(upserted));
            }
            Ok(reply)
        })
        .await
    }

    async fn delete(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "delete")?;
        let ns = namespace(db, &coll);
        let Some(Value::Array(statements)) = command.get("deletes") else {
            return Err(MonoError::InvalidArgument("delete requires a deletes array".into()));
        };
        let statements = statements.clone();

        self.with_write(&ns, ctx, |txn| {
            let mut deleted = 0i32;
            for (index, statement) in statements.iter().enumerate() {
                let Value::Document(stmt) = statement else {
                    return Err(MonoError::InvalidArgument(format!("delete statement {index} must be a document")));
                };
                let query = as_document(stmt.get("q")).unwrap_or_default();
                let limit_one = matches!(stmt.get("limit"), Some(Value::Int32(1)) | Some(Value::Int64(1)));
                let target_query = if limit_one { self.narrow_to_first_match(&coll, &query)?.unwrap_or(query) } else { query };
                deleted += self.engine.delete_many(&coll, &target_query, txn)? as i32;
            }
            let mut reply = ok_doc();
            reply.insert("n", Value::Int32(deleted));
            Ok(reply)
        })
        .await
    }

    #[allow(clippy::too_many_lines)]
    async fn find_and_modify(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "findAndModify")?;
        let ns = namespace(db, &coll);
        let query = as_document(command.get("query")).unwrap_or_default();
        let sort = as_document(command.get("sort"));
        let update_doc = as_document(command.get("update"));
        let remove = matches!(command.get("remove"), Some(Value::Boolean(true)));
        let upsert = matches!(command.get("upsert"), Some(Value::Boolean(true)));
        let new_image = matches!(command.get("new"), Some(Value::Boolean(true)));
        if !remove && update_doc.is_none() {
            return Err(MonoError::InvalidArgument("findAndModify requires update or remove".into()));
        }

        self.with_write(&ns, ctx, |txn| {
            let result = self.engine.find_and_modify(&coll, &query, sort.as_ref(), update_doc.as_ref(), remove, upsert, new_image, txn)?;
            let mut value_doc = ok_doc();
            value_doc.insert("value", result.map_or(Value::Null, Value::Document));
            Ok(value_doc)
        })
        .await
    }

    async fn distinct(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "distinct")?;
        let ns = namespace(db, &coll);
        let field = match command.get("key") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(MonoError::InvalidArgument("distinct requires a key field".into())),
        };
        let query = as_document(command.get("query")).unwrap_or_default();
        self.with_read(&ns, ctx, || {
            let values = self.engine.distinct(&coll, &field, &query)?;
            let mut reply = ok_doc();
            reply.insert("values", Value::Array(values));
            Ok(reply)
        })
        .await
    }

    async fn count(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "count")?;
        let ns = namespace(db, &coll);
        let query = as_document(command.get("query")).unwrap_or_default();
        self.with_read(&ns, ctx, || {
            let n = self.engine.count(&coll, &query)?;
            let mut reply = ok_doc();
            reply.insert("n", Value::Int32(n as i32));
            Ok(reply)
        })
        .await
    }

    async fn aggregate(&self, db: &str, command: &Document, ctx: &CommandContext) -> MonoResult<Document> {
        let coll = target_collection(command, "aggregate")?;
        let ns = namespace(db, &coll);
        let Some(Value::Array(stages)) = command.get("pipeline") else {
            return Err(MonoError::InvalidArgument("aggregate requires a pipeline array".into()));
        };
        let pipeline: Vec<Document> = stages
            .iter()
            .map(|v| match v {
                Value::Document(d) => Ok(d.clone()),
                _ => Err(MonoError::InvalidArgument("pipeline stages must be documents".into())),
            })
            .collect::<MonoResult<_>>()?;
        let batch_size = match command.get("cursor") {
            Some(Value::Document(c)) => as_usize(c.get("batchSize")).unwrap_or(DEFAULT_CURSOR_BATCH),
            _ => DEFAULT_CURSOR_BATCH,
        };

        self.with_read(&ns, ctx, || {
            let docs = self.engine.aggregate(&coll, &pipeline)?;
            let (cursor_id, first_batch) = self.engine.cursors.open(namespace(db, &coll), docs.into(), batch_size);
            Ok(cursor_reply(cursor_id, namespace(db, &coll), "firstBatch", first_batch))
        })
        .await
    }

    // -- Sessions & transactions ------------------------------------------

    fn start_session(&self) -> Document {
        let id = ObjectId::new();
        let mut lsid = Document::new();
        lsid.insert("id", Value::Binary(0, id.0.to_vec()));
        let mut reply = ok_doc();
        reply.insert("id", Value::Document(lsid));
        reply.insert("timeoutMinutes", Value::Int32(30));
        reply
    }

    fn end_sessions(&self, command: &Document) -> Document {
        for lsid in session_ids(command, "endSessions") {
            self.engine.sessions.end_session(&lsid);
        }
        ok_doc()
    }

    fn refresh_sessions(&self, command: &Document) -> Document {
        for lsid in session_ids(command, "refreshSessions") {
            self.engine.sessions.touch(&lsid);
        }
        ok_doc()
    }

    fn start_transaction(&self, ctx: &CommandContext) -> MonoResult<Document> {
        let lsid = ctx.lsid.as_ref().ok_or_else(|| MonoError::InvalidArgument("startTransaction requires lsid".into()))?;
        let txn_number = ctx.txn_number.ok_or_else(|| MonoError::InvalidArgument("startTransaction requires txnNumber".into()))?;
        if ctx.autocommit {
            return Err(MonoError::InvalidArgument("startTransaction requires autocommit=false".into()));
        }
        let txn = self.engine.begin_transaction(LOCK_TIMEOUT);
        if let Some(previous) = self.engine.sessions.start_transaction(lsid, txn_number, txn)? {
            // A transaction was already in flight on this session; starting
            // a new one implicitly ends it.
            let _ = self.engine.abort_transaction(&previous);
        }
        Ok(ok_doc())
    }

    fn commit_transaction(&self, ctx: &CommandContext) -> MonoResult<Document> {
        let txn = self.session_txn(ctx).ok_or(MonoError::NoSuchTransaction)?;
        self.engine.commit_transaction(&txn)?;
        if let Some(lsid) = &ctx.lsid {
            self.engine.sessions.clear_transaction(lsid);
        }
        Ok(ok_doc())
    }

    fn abort_transaction(&self, ctx: &CommandContext) -> MonoResult<Document> {
        let txn = self.session_txn(ctx).ok_or(MonoError::NoSuchTransaction)?;
        self.engine.abort_transaction(&txn)?;
        if let Some(lsid) = &ctx.lsid {
            self.engine.sessions.clear_transaction(lsid);
        }
        Ok(ok_doc())
    }

    // -- Locking helpers ---------------------------------------------------

    fn session_txn(&self, ctx: &CommandContext) -> Option<Arc<Txn>> {
        let lsid = ctx.lsid.as_ref()?;
        let txn_number = ctx.txn_number?;
        self.engine.sessions.active_transaction(lsid, txn_number)
    }

    /// Resolves the single document a non-`multi` update/delete statement
    /// applies to and rewrites it as an `_id` equality query, so the
    /// underlying `update_many`/`delete_many` call only ever touches that
    /// one record.
    fn narrow_to_first_match(&self, coll: &str, query: &Document) -> MonoResult<Option<Document>> {
        let matches = self.engine.find(coll, query, None, 0, Some(1))?;
        Ok(matches.into_iter().next().map(|doc| {
            let mut id_query = Document::new();
            id_query.insert("_id", doc.get("_id").cloned().unwrap_or(Value::Null));
            id_query
        }))
    }

    /// Runs `f` under a shared lock on `ns`: the session's active
    /// transaction if one covers this call, or a throwaway implicit
    /// transaction released immediately after.
    async fn with_read<F>(&self, ns: &str, ctx: &CommandContext, f: F) -> MonoResult<Document>
    where
        F: FnOnce() -> MonoResult<Document>,
    {
        match self.session_txn(ctx) {
            Some(txn) => {
                self.engine.lock_manager.acquire(ns, LockMode::Shared, txn.id, txn.timeout).await?;
                txn.note_lock_held(ns);
                f()
            }
            None => {
                let txn = self.engine.begin_transaction(LOCK_TIMEOUT);
                self.engine.lock_manager.acquire(ns, LockMode::Shared, txn.id, txn.timeout).await?;
                let result = f();
                self.engine.lock_manager.release(ns, txn.id);
                self.engine.txn_manager.forget(txn.id);
                result
            }
        }
    }

    /// Runs `f` under an exclusive lock on `ns`, passing the governing
    /// transaction through so mutations record undo entries. A call not
    /// covered by a session transaction commits (or aborts, on error) its
    /// implicit transaction before returning.
    async fn with_write<F>(&self, ns: &str, ctx: &CommandContext, f: F) -> MonoResult<Document>
    where
        F: FnOnce(Option<&Arc<Txn>>) -> MonoResult<Document>,
    {
        match self.session_txn(ctx) {
            Some(txn) => {
                self.engine.lock_manager.acquire(ns, LockMode::Exclusive, txn.id, txn.timeout).await?;
                txn.note_lock_held(ns);
                f(Some(&txn))
            }
            None => {
                let txn = self.engine.begin_transaction(LOCK_TIMEOUT);
                self.engine.lock_manager.acquire(ns, LockMode::Exclusive, txn.id, txn.timeout).await?;
                match f(Some(&txn)) {
                    Ok(doc) => {
                        self.engine.commit_transaction(&txn)?;
                        Ok(doc)
                    }
                    Err(err) => {
                        let _ = self.engine.abort_transaction(&txn);
                        Err(err)
                    }
                }
            }
        }
    }
}

fn ok_doc() -> Document {
    let mut doc = Document::new();
    doc.insert("ok", Value::Double(1.0));
    doc
}

fn namespace(db: &str, collection: &str) -> String {
    format!("{db}.{collection}")
}

fn target_collection(command: &Document, cmd_name: &str) -> MonoResult<String> {
    match command.get(cmd_name) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(MonoError::InvalidArgument(format!("{cmd_name} requires a collection name"))),
    }
}

fn as_document(v: Option<&Value>) -> Option<Document> {
    match v {
        Some(Value::Document(d)) => Some(d.clone()),
        _ => None,
    }
}

fn as_usize(v: Option<&Value>) -> Option<usize> {
    match v {
        Some(Value::Int32(n)) if *n >= 0 => Some(*n as usize),
        Some(Value::Int64(n)) if *n >= 0 => Some(*n as usize),
        Some(Value::Double(n)) if *n >= 0.0 => Some(*n as usize),
        _ => None,
    }
}

fn parse_key_spec(doc: &Document) -> MonoResult<Vec<KeyField>> {
    doc.iter()
        .map(|(path, dir)| {
            let descending = match dir {
                Value::Int32(n) => *n < 0,
                Value::Int64(n) => *n < 0,
                Value::Double(n) => *n < 0.0,
                _ => return Err(MonoError::InvalidArgument("index key direction must be numeric".into())),
            };
            Ok(KeyField { path: path.to_string(), descending })
        })
        .collect()
}

fn default_index_name(key: &[KeyField]) -> String {
    key.iter().map(|f| format!("{}_{}", f.path, if f.descending { -1 } else { 1 })).collect::<Vec<_>>().join("_")
}

fn index_entry_to_document(entry: crate::catalog::IndexEntry) -> Value {
    let mut key_doc = Document::new();
    for field in &entry.key {
        key_doc.insert(field.path.clone(), Value::Int32(if field.descending { -1 } else { 1 }));
    }
    let mut doc = Document::new();
    doc.insert("name", Value::String(entry.name));
    doc.insert("key", Value::Document(key_doc));
    doc.insert("unique", Value::Boolean(entry.unique));
    Value::Document(doc)
}

fn session_ids(command: &Document, cmd_name: &str) -> Vec<Vec<u8>> {
    let Some(Value::Array(items)) = command.get(cmd_name) else { return Vec::new() };
    items
        .iter()
        .filter_map(|v| match v {
            Value::Document(d) => match d.get("id") {
                Some(Value::Binary(_, bytes)) => Some(bytes.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn cursor_reply(cursor_id: u64, ns: String, batch_key: &str, batch: Vec<Document>) -> Document {
    let mut cursor = Document::new();
    cursor.insert("id", Value::Int64(cursor_id as i64));
    cursor.insert("ns", Value::String(ns));
    cursor.insert(batch_key, Value::Array(batch.into_iter().map(Value::Document).collect()));
    let mut reply = ok_doc();
    reply.insert("cursor", Value::Document(cursor));
    reply
}

/// Builds the `{ok: 0, errmsg, code, codeName}` envelope, adding
/// `keyPattern`/`keyValue` for duplicate-key errors by looking the
/// offending index back up in the catalog (§6, scenario 2).
fn enrich_error(engine: &Engine, err: &MonoError, doc: Option<&Document>) -> Document {
    let mut envelope = err.to_envelope();
    if let MonoError::DuplicateKey { ns, index, .. } = err {
        if let Ok(indexes) = engine.list_indexes(ns) {
            if let Some(entry) = indexes.iter().find(|e| &e.name == index) {
                let mut key_pattern = Document::new();
                for field in &entry.key {
                    key_pattern.insert(field.path.clone(), Value::Int32(if field.descending { -1 } else { 1 }));
                }
                envelope.insert("keyPattern", Value::Document(key_pattern));
                if let Some(doc) = doc {
                    let mut key_value = Document::new();
                    for field in &entry.key {
                        key_value.insert(field.path.clone(), doc.get_path(&field.path).cloned().unwrap_or(Value::Null));
                    }
                    envelope.insert("keyValue", Value::Document(key_value));
                }
            }
        }
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn router() -> (tempfile::TempDir, CommandRouter) {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(dir.path().join("t.monodb")).unwrap());
        (dir, CommandRouter::new(engine))
    }

    fn cmd(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let (_dir, router) = router();
        let reply = router.dispatch("test", &cmd(&[("bogus", Value::Int32(1))])).await;
        assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)));
        assert_eq!(reply.get("codeName"), Some(&Value::String("CommandNotFound".to_string())));
    }

    #[tokio::test]
    async fn insert_then_find_round_trips_a_document() {
        let (_dir, router) = router();
        router.dispatch("test", &cmd(&[("create", Value::String("users".into()))])).await;

        let mut alice = Document::new();
        alice.insert("name", Value::String("Alice".into()));
        alice.insert("age", Value::Int32(25));
        let insert_cmd = cmd(&[("insert", Value::String("users".into())), ("documents", Value::Array(vec![Value::Document(alice)]))]);
        let reply = router.dispatch("test", &insert_cmd).await;
        assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));
        assert_eq!(reply.get("n"), Some(&Value::Int32(1)));

        let mut gt = Document::new();
        gt.insert("$gt", Value::Int32(20));
        let mut filter = Document::new();
        filter.insert("age", Value::Document(gt));
        let find_cmd = cmd(&[("find", Value::String("users".into())), ("filter", Value::Document(filter))]);
        let reply = router.dispatch("test", &find_cmd).await;
        let Some(Value::Document(cursor)) = reply.get("cursor") else { panic!("missing cursor") };
        let Some(Value::Array(batch)) = cursor.get("firstBatch") else { panic!("missing firstBatch") };
        assert_eq!(batch.len(), 1);
        let Value::Document(found) = &batch[0] else { panic!("not a document") };
        assert!(matches!(found.get("_id"), Some(Value::ObjectId(_))));
    }

    #[tokio::test]
    async fn duplicate_key_error_carries_key_pattern_and_value() {
        let (_dir, router) = router();
        router.dispatch("test", &cmd(&[("create", Value::String("users".into()))])).await;
        let mut key = Document::new();
        key.insert("email", Value::Int32(1));
        let mut index_spec = Document::new();
        index_spec.insert("key", Value::Document(key));
        index_spec.insert("unique", Value::Boolean(true));
        index_spec.insert("name", Value::String("email_1".into()));
        let create_idx = cmd(&[
            ("createIndexes", Value::String("users".into())),
            ("indexes", Value::Array(vec![Value::Document(index_spec)])),
        ]);
        assert_eq!(router.dispatch("test", &create_idx).await.get("ok"), Some(&Value::Double(1.0)));

        let doc_for = |email: &str| {
            let mut d = Document::new();
            d.insert("email", Value::String(email.to_string()));
            cmd(&[("insert", Value::String("users".into())), ("documents", Value::Array(vec![Value::Document(d)]))])
        };
        router.dispatch("test", &doc_for("a@x")).await;
        let reply = router.dispatch("test", &doc_for("a@x")).await;
        let Some(Value::Array(errors)) = reply.get("writeErrors") else { panic!("expected writeErrors") };
        let Value::Document(first_error) = &errors[0] else { panic!("not a document") };
        let Some(Value::Document(key_pattern)) = first_error.get("keyPattern") else { panic!("missing keyPattern") };
        assert_eq!(key_pattern.get("email"), Some(&Value::Int32(1)));
        let Some(Value::Document(key_value)) = first_error.get("keyValue") else { panic!("missing keyValue") };
        assert_eq!(key_value.get("email"), Some(&Value::String("a@x".to_string())));
    }

    #[tokio::test]
    async fn transaction_abort_rolls_back_through_the_command_layer() {
        let (_dir, router) = router();
        router.dispatch("test", &cmd(&[("create", Value::String("nums".into()))])).await;

        let lsid_bytes = vec![9, 9, 9];
        let mut lsid = Document::new();
        lsid.insert("id", Value::Binary(0, lsid_bytes.clone()));
        let start = cmd(&[
            ("startTransaction", Value::Int32(1)),
            ("lsid", Value::Document(lsid.clone())),
            ("txnNumber", Value::Int64(1)),
            ("autocommit", Value::Boolean(false)),
        ]);
        assert_eq!(router.dispatch("test", &start).await.get("ok"), Some(&Value::Double(1.0)));

        let mut seven = Document::new();
        seven.insert("x", Value::Int32(7));
        let insert_cmd = cmd(&[
            ("insert", Value::String("nums".into())),
            ("documents", Value::Array(vec![Value::Document(seven)])),
            ("lsid", Value::Document(lsid.clone())),
            ("txnNumber", Value::Int64(1)),
            ("autocommit", Value::Boolean(false)),
        ]);
        assert_eq!(router.dispatch("test", &insert_cmd).await.get("n"), Some(&Value::Int32(1)));

        let abort = cmd(&[("abortTransaction", Value::Int32(1)), ("lsid", Value::Document(lsid)), ("txnNumber", Value::Int64(1))]);
        assert_eq!(router.dispatch("test", &abort).await.get("ok"), Some(&Value::Double(1.0)));

        let find_cmd = cmd(&[("find", Value::String("nums".into())), ("filter", Value::Document(Document::new()))]);
        let reply = router.dispatch("test", &find_cmd).await;
        let Some(Value::Document(cursor)) = reply.get("cursor") else { panic!("missing cursor") };
        assert_eq!(cursor.get("firstBatch"), Some(&Value::Array(Vec::new())));
    }

    #[tokio::test]
    async fn starting_a_transaction_twice_with_the_same_number_is_rejected() {
        let (_dir, router) = router();
        let mut lsid = Document::new();
        lsid.insert("id", Value::Binary(0, vec![1]));
        let start = cmd(&[
            ("startTransaction", Value::Int32(1)),
            ("lsid", Value::Document(lsid.clone())),
            ("txnNumber", Value::Int64(5)),
            ("autocommit", Value::Boolean(false)),
        ]);
        assert_eq!(router.dispatch("test", &start).await.get("ok"), Some(&Value::Double(1.0)));
        let reply = router.dispatch("test", &start).await;
        assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)));
    }
}
