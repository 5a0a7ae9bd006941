#![forbid(unsafe_code)]
//! In-process engine for datarepo.
//!
//! Tables are created on first use. Writes are visible to every connection at once;
//! isolation between connections comes only from row locks. Each connection keeps an
//! undo log while a transaction is open, so rollback and savepoints restore prior rows.

mod eval;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use datarepo_core::engine::Engine;
use datarepo_core::query::{
    BulkDelete, BulkUpdate, CountQuery, Join, JoinKind, LockMode, Predicate, SelectQuery,
    Selection, SetExpr,
};
use datarepo_core::transactions::TransactionDefinition;
use datarepo_core::{EntityKey, EntityMeta, ParamValue, Record, RepoError, RepoResult};

use eval::{compare_rows, eval, Joined};

#[cfg(feature = "tracing")]
use tracing::info;

#[inline]
#[allow(unused_variables)]
fn obs_record(op: &str, table: &str, start: Instant, rows: usize, success: bool) {
    let elapsed = start.elapsed().as_millis() as u64;
    #[cfg(feature = "tracing")]
    {
        info!(
            sql_kind = "memory",
            table = table,
            op = op,
            rows = rows,
            elapsed_ms = elapsed,
            success = success,
            "repo op"
        );
    }
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("repo_ops_total", 1, "op" => op.to_string(), "table" => table.to_string(), "success" => success.to_string());
        metrics::histogram!("repo_op_duration_ms", elapsed as f64, "op" => op.to_string(), "table" => table.to_string());
        if !success {
            metrics::counter!("repo_op_errors_total", 1, "op" => op.to_string(), "table" => table.to_string());
        }
    }
}

/// Record the outcome of `result` and pass it through.
fn observed<T>(
    op: &str,
    table: &str,
    start: Instant,
    result: RepoResult<T>,
    rows: impl FnOnce(&T) -> usize,
) -> RepoResult<T> {
    match &result {
        Ok(v) => obs_record(op, table, start, rows(v), true),
        Err(_) => obs_record(op, table, start, 0, false),
    }
    result
}

#[derive(Debug, thiserror::Error)]
enum MemoryError {
    #[error("duplicate key {key} in table {table}")]
    DuplicateKey { table: String, key: EntityKey },
    #[error("cannot write in a read-only transaction")]
    ReadOnly,
    #[error("a transaction is already active on this connection")]
    AlreadyInTransaction,
    #[error("no active transaction")]
    NoTransaction,
    #[error("no savepoint named {0}")]
    NoSavepoint(String),
    #[error("cannot apply arithmetic to {0}")]
    Arithmetic(String),
}

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<EntityKey, Record>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct RowLock {
    writer: Option<u64>,
    readers: HashSet<u64>,
}

enum Undo {
    Row {
        table: &'static str,
        key: EntityKey,
        prior: Option<Record>,
    },
    NextId {
        table: &'static str,
        prior: i64,
    },
}

struct Tx {
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    read_only: bool,
}

#[derive(Default)]
struct State {
    tables: HashMap<&'static str, Table>,
    locks: HashMap<(&'static str, EntityKey), RowLock>,
    next_conn: u64,
}

impl State {
    fn table(&mut self, name: &'static str) -> &mut Table {
        self.tables.entry(name).or_default()
    }

    fn release_locks(&mut self, conn: u64) {
        self.locks.retain(|_, lock| {
            if lock.writer == Some(conn) {
                lock.writer = None;
            }
            lock.readers.remove(&conn);
            lock.writer.is_some() || !lock.readers.is_empty()
        });
    }

    fn undo(&mut self, entries: Vec<Undo>) {
        for entry in entries.into_iter().rev() {
            match entry {
                Undo::Row { table, key, prior } => {
                    let rows = &mut self.table(table).rows;
                    match prior {
                        Some(rec) => {
                            rows.insert(key, rec);
                        }
                        None => {
                            rows.remove(&key);
                        }
                    }
                }
                Undo::NextId { table, prior } => self.table(table).next_id = prior,
            }
        }
    }

    fn check_lock(&self, conn: u64, table: &'static str, key: &EntityKey, mode: LockMode) -> RepoResult<()> {
        let Some(lock) = self.locks.get(&(table, key.clone())) else {
            return Ok(());
        };
        let foreign_writer = lock.writer.is_some_and(|w| w != conn);
        let foreign_reader = lock.readers.iter().any(|r| *r != conn);
        let conflict = match mode {
            LockMode::None => false,
            LockMode::PessimisticRead => foreign_writer,
            LockMode::PessimisticWrite => foreign_writer || foreign_reader,
        };
        if conflict {
            return Err(RepoError::LockUnavailable {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn take_lock(&mut self, conn: u64, table: &'static str, key: EntityKey, mode: LockMode) {
        let lock = self.locks.entry((table, key)).or_default();
        match mode {
            LockMode::None => {}
            LockMode::PessimisticRead => {
                if lock.writer != Some(conn) {
                    lock.readers.insert(conn);
                }
            }
            LockMode::PessimisticWrite => {
                lock.readers.remove(&conn);
                lock.writer = Some(conn);
            }
        }
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory store shared by every connection created from it. Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_state(&self.state);
        f.debug_struct("MemoryEngine")
            .field("tables", &state.tables.len())
            .field("locks", &state.locks.len())
            .finish()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed-or-pending rows in `table`, bypassing any session.
    pub fn row_count(&self, table: &str) -> usize {
        lock_state(&self.state)
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Number of rows currently locked by any connection.
    pub fn locked_rows(&self) -> usize {
        lock_state(&self.state).locks.len()
    }
}

/// One connection. Dropping it rolls back an open transaction and releases its locks.
pub struct MemoryConn {
    id: u64,
    state: Arc<Mutex<State>>,
    tx: Option<Tx>,
}

impl MemoryConn {
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn record_undo(&mut self, entry: Undo) {
        if let Some(tx) = &mut self.tx {
            tx.undo.push(entry);
        }
    }

    fn ensure_writable(&self) -> RepoResult<()> {
        match &self.tx {
            Some(tx) if tx.read_only => Err(RepoError::backend(MemoryError::ReadOnly)),
            _ => Ok(()),
        }
    }

    /// Write lock inside a transaction; outside one a write only has to avoid foreign locks.
    fn lock_for_write(&self, state: &mut State, table: &'static str, keys: &[EntityKey]) -> RepoResult<()> {
        for key in keys {
            state.check_lock(self.id, table, key, LockMode::PessimisticWrite)?;
        }
        if self.tx.is_some() {
            for key in keys {
                state.take_lock(self.id, table, key.clone(), LockMode::PessimisticWrite);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        if let Some(tx) = self.tx.take() {
            state.undo(tx.undo);
        }
        state.release_locks(self.id);
    }
}

/// Rows of `meta.table` matching `filter`, with their related rows resolved for `joins`.
fn matching<'s>(
    state: &'s State,
    meta: &EntityMeta,
    joins: &[Join],
    filter: Option<&Predicate>,
) -> RepoResult<Vec<(&'s EntityKey, Joined<'s>)>> {
    let Some(table) = state.tables.get(meta.table) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    'rows: for (key, root) in &table.rows {
        let mut related = Vec::with_capacity(joins.len());
        for join in joins {
            let rel = meta.relation(&join.relation).ok_or_else(|| {
                datarepo_core::QueryError::UnknownRelation {
                    entity: meta.name.to_string(),
                    relation: join.relation.clone(),
                }
            })?;
            let target = root
                .get(rel.column)
                .and_then(ParamValue::entity_key)
                .and_then(|k| state.tables.get(rel.table).and_then(|t| t.rows.get(&k)));
            if target.is_none() && join.kind == JoinKind::Inner {
                continue 'rows;
            }
            related.push((rel.name, target));
        }
        let row = Joined { root, related };
        if let Some(f) = filter {
            if eval(f, &row)? != Some(true) {
                continue;
            }
        }
        out.push((key, row));
    }
    Ok(out)
}

fn project(query: &SelectQuery, joins: &[Join], row: &Joined<'_>) -> Record {
    let meta = &query.entity;
    match &query.selection {
        Selection::Columns(paths) => paths
            .iter()
            .map(|p| (p.to_string(), row.value(p)))
            .collect(),
        Selection::Entity => {
            let mut rec: Record = meta
                .columns
                .iter()
                .map(|c| {
                    let v = row.root.get(c).cloned().unwrap_or(ParamValue::Null);
                    (c.to_string(), v)
                })
                .collect();
            for join in joins.iter().filter(|j| j.fetch) {
                let Some(rel) = meta.relation(&join.relation) else {
                    continue;
                };
                let target = row
                    .related
                    .iter()
                    .find(|(name, _)| *name == rel.name)
                    .and_then(|(_, r)| *r);
                for c in rel.columns {
                    let v = target
                        .and_then(|t| t.get(c))
                        .cloned()
                        .unwrap_or(ParamValue::Null);
                    rec.set(format!("{}.{c}", rel.name), v);
                }
            }
            rec
        }
    }
}

fn arithmetic(current: &ParamValue, delta: &ParamValue, negate: bool) -> RepoResult<ParamValue> {
    let err = || RepoError::backend(MemoryError::Arithmetic(format!("{current} and {delta}")));
    Ok(match (current, delta) {
        (ParamValue::Null, _) | (_, ParamValue::Null) => ParamValue::Null,
        (ParamValue::F64(_), _) | (_, ParamValue::F64(_)) => {
            let (a, b) = (current.as_f64().ok_or_else(err)?, delta.as_f64().ok_or_else(err)?);
            ParamValue::F64(if negate { a - b } else { a + b })
        }
        _ => {
            let (a, b) = (current.as_i64().ok_or_else(err)?, delta.as_i64().ok_or_else(err)?);
            let v = if negate { a.checked_sub(b) } else { a.checked_add(b) }.ok_or_else(err)?;
            match current {
                ParamValue::I32(_) => i32::try_from(v).map_or(ParamValue::I64(v), ParamValue::I32),
                _ => ParamValue::I64(v),
            }
        }
    })
}

fn unbound(o: &datarepo_core::query::Operand) -> RepoResult<ParamValue> {
    match o {
        datarepo_core::query::Operand::Value(v) => Ok(v.clone()),
        other => Err(datarepo_core::QueryError::MissingParameter(format!("{other:?}")).into()),
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    type Conn = MemoryConn;

    async fn connect(&self) -> RepoResult<MemoryConn> {
        let mut state = lock_state(&self.state);
        state.next_conn += 1;
        Ok(MemoryConn {
            id: state.next_conn,
            state: self.state.clone(),
            tx: None,
        })
    }

    async fn begin(&self, conn: &mut MemoryConn, def: &TransactionDefinition) -> RepoResult<()> {
        if conn.tx.is_some() {
            return Err(RepoError::backend(MemoryError::AlreadyInTransaction));
        }
        conn.tx = Some(Tx {
            undo: Vec::new(),
            savepoints: Vec::new(),
            read_only: def.read_only,
        });
        Ok(())
    }

    async fn commit(&self, conn: &mut MemoryConn) -> RepoResult<()> {
        conn.tx
            .take()
            .ok_or_else(|| RepoError::backend(MemoryError::NoTransaction))?;
        lock_state(&self.state).release_locks(conn.id);
        Ok(())
    }

    async fn rollback(&self, conn: &mut MemoryConn) -> RepoResult<()> {
        let tx = conn
            .tx
            .take()
            .ok_or_else(|| RepoError::backend(MemoryError::NoTransaction))?;
        let mut state = lock_state(&self.state);
        state.undo(tx.undo);
        state.release_locks(conn.id);
        Ok(())
    }

    async fn savepoint(&self, conn: &mut MemoryConn, name: &str) -> RepoResult<()> {
        let tx = conn
            .tx
            .as_mut()
            .ok_or_else(|| RepoError::backend(MemoryError::NoTransaction))?;
        tx.savepoints.push((name.to_string(), tx.undo.len()));
        Ok(())
    }

    async fn release_savepoint(&self, conn: &mut MemoryConn, name: &str) -> RepoResult<()> {
        let tx = conn
            .tx
            .as_mut()
            .ok_or_else(|| RepoError::backend(MemoryError::NoTransaction))?;
        let idx = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| RepoError::backend(MemoryError::NoSavepoint(name.to_string())))?;
        tx.savepoints.truncate(idx);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, conn: &mut MemoryConn, name: &str) -> RepoResult<()> {
        let tx = conn
            .tx
            .as_mut()
            .ok_or_else(|| RepoError::backend(MemoryError::NoTransaction))?;
        let (idx, mark) = tx
            .savepoints
            .iter()
            .enumerate()
            .rev()
            .find(|(_, (n, _))| n == name)
            .map(|(i, (_, mark))| (i, *mark))
            .ok_or_else(|| RepoError::backend(MemoryError::NoSavepoint(name.to_string())))?;
        // The savepoint itself survives, later ones do not.
        tx.savepoints.truncate(idx + 1);
        let entries = tx.undo.split_off(mark);
        lock_state(&self.state).undo(entries);
        Ok(())
    }

    async fn select(&self, conn: &mut MemoryConn, query: &SelectQuery) -> RepoResult<Vec<Record>> {
        let start = Instant::now();
        let table = query.entity.table;
        let result: RepoResult<Vec<Record>> = (|| {
            if query.lock != LockMode::None && conn.tx.is_none() {
                return Err(RepoError::TransactionRequired {
                    operation: "pessimistic locking",
                });
            }
            let mut state = lock_state(&self.state);
            let joins = query.effective_joins();
            let (keys, mut records) = {
                let mut rows = matching(&state, &query.entity, &joins, query.filter.as_ref())?;
                if !query.sort.is_unsorted() {
                    rows.sort_by(|(_, a), (_, b)| compare_rows(&query.sort, a, b));
                }
                let mut keys = Vec::with_capacity(rows.len());
                let mut records: Vec<Record> = Vec::with_capacity(rows.len());
                for (key, row) in &rows {
                    let rec = project(query, &joins, row);
                    if query.distinct && records.contains(&rec) {
                        continue;
                    }
                    keys.push((*key).clone());
                    records.push(rec);
                }
                (keys, records)
            };
            let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
            let limit = query
                .limit
                .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
            let end = offset.saturating_add(limit).min(records.len());
            let start_idx = offset.min(records.len());
            records.truncate(end);
            records.drain(..start_idx);
            let keys = &keys[start_idx..end];
            if query.lock != LockMode::None {
                for key in keys {
                    state.check_lock(conn.id, table, key, query.lock)?;
                }
                for key in keys {
                    state.take_lock(conn.id, table, key.clone(), query.lock);
                }
            }
            Ok(records)
        })();
        observed("select", table, start, result, Vec::len)
    }

    async fn count(&self, _conn: &mut MemoryConn, query: &CountQuery) -> RepoResult<u64> {
        let start = Instant::now();
        let result: RepoResult<u64> = (|| {
            let state = lock_state(&self.state);
            let select = query.as_select();
            let n = matching(&state, &query.entity, &select.effective_joins(), query.filter.as_ref())?.len();
            Ok(n as u64)
        })();
        observed("count", query.entity.table, start, result, |_| 1)
    }

    async fn insert(
        &self,
        conn: &mut MemoryConn,
        meta: &EntityMeta,
        values: &Record,
    ) -> RepoResult<ParamValue> {
        let start = Instant::now();
        let result: RepoResult<ParamValue> = (|| {
            conn.ensure_writable()?;
            let mut state = lock_state(&self.state);
            let table = state.table(meta.table);
            let prior_next = table.next_id;
            let key = match values.get(meta.id_column).and_then(ParamValue::entity_key) {
                Some(k) => k,
                None => EntityKey::Int(table.next_id + 1),
            };
            if table.rows.contains_key(&key) {
                return Err(RepoError::backend(MemoryError::DuplicateKey {
                    table: meta.table.to_string(),
                    key,
                }));
            }
            conn.lock_for_write(&mut state, meta.table, std::slice::from_ref(&key))?;
            let table = state.table(meta.table);
            if let EntityKey::Int(v) = key {
                table.next_id = table.next_id.max(v);
            }
            let mut row = values.clone();
            row.set(meta.id_column, key.to_param());
            table.rows.insert(key.clone(), row);
            conn.record_undo(Undo::NextId {
                table: meta.table,
                prior: prior_next,
            });
            conn.record_undo(Undo::Row {
                table: meta.table,
                key: key.clone(),
                prior: None,
            });
            Ok(key.to_param())
        })();
        observed("insert", meta.table, start, result, |_| 1)
    }

    async fn update(
        &self,
        conn: &mut MemoryConn,
        meta: &EntityMeta,
        key: &ParamValue,
        values: &Record,
    ) -> RepoResult<u64> {
        let start = Instant::now();
        let result: RepoResult<u64> = (|| {
            conn.ensure_writable()?;
            let Some(key) = key.entity_key() else {
                return Ok(0);
            };
            let mut state = lock_state(&self.state);
            let Some(prior) = state.table(meta.table).rows.get(&key).cloned() else {
                return Ok(0);
            };
            conn.lock_for_write(&mut state, meta.table, std::slice::from_ref(&key))?;
            let mut row = prior.clone();
            for (col, v) in values.iter().filter(|(c, _)| *c != meta.id_column) {
                row.set(col, v.clone());
            }
            state.table(meta.table).rows.insert(key.clone(), row);
            conn.record_undo(Undo::Row {
                table: meta.table,
                key,
                prior: Some(prior),
            });
            Ok(1)
        })();
        observed("update", meta.table, start, result, |n| *n as usize)
    }

    async fn delete(&self, conn: &mut MemoryConn, meta: &EntityMeta, key: &ParamValue) -> RepoResult<u64> {
        let start = Instant::now();
        let result: RepoResult<u64> = (|| {
            conn.ensure_writable()?;
            let Some(key) = key.entity_key() else {
                return Ok(0);
            };
            let mut state = lock_state(&self.state);
            if !state.table(meta.table).rows.contains_key(&key) {
                return Ok(0);
            }
            conn.lock_for_write(&mut state, meta.table, std::slice::from_ref(&key))?;
            let prior = state.table(meta.table).rows.remove(&key);
            conn.record_undo(Undo::Row {
                table: meta.table,
                key,
                prior,
            });
            Ok(1)
        })();
        observed("delete", meta.table, start, result, |n| *n as usize)
    }

    async fn bulk_update(&self, conn: &mut MemoryConn, stmt: &BulkUpdate) -> RepoResult<u64> {
        let start = Instant::now();
        let table = stmt.entity.table;
        let result: RepoResult<u64> = (|| {
            conn.ensure_writable()?;
            let mut state = lock_state(&self.state);
            let joins = SelectQuery::new(stmt.entity)
                .filter_opt(stmt.filter.clone())
                .effective_joins();
            let mut changes = Vec::new();
            for (key, row) in matching(&state, &stmt.entity, &joins, stmt.filter.as_ref())? {
                let mut updated = row.root.clone();
                for a in &stmt.assignments {
                    let v = match &a.value {
                        SetExpr::Value(o) => unbound(o)?,
                        SetExpr::Add(c, o) => {
                            arithmetic(row.root.get(c).unwrap_or(&ParamValue::Null), &unbound(o)?, false)?
                        }
                        SetExpr::Sub(c, o) => {
                            arithmetic(row.root.get(c).unwrap_or(&ParamValue::Null), &unbound(o)?, true)?
                        }
                    };
                    updated.set(a.column.clone(), v);
                }
                changes.push((key.clone(), row.root.clone(), updated));
            }
            let keys: Vec<EntityKey> = changes.iter().map(|(k, _, _)| k.clone()).collect();
            conn.lock_for_write(&mut state, table, &keys)?;
            let n = changes.len() as u64;
            for (key, prior, updated) in changes {
                state.table(table).rows.insert(key.clone(), updated);
                conn.record_undo(Undo::Row {
                    table,
                    key,
                    prior: Some(prior),
                });
            }
            Ok(n)
        })();
        observed("bulk_update", table, start, result, |n| *n as usize)
    }

    async fn bulk_delete(&self, conn: &mut MemoryConn, stmt: &BulkDelete) -> RepoResult<u64> {
        let start = Instant::now();
        let table = stmt.entity.table;
        let result: RepoResult<u64> = (|| {
            conn.ensure_writable()?;
            let mut state = lock_state(&self.state);
            let joins = SelectQuery::new(stmt.entity)
                .filter_opt(stmt.filter.clone())
                .effective_joins();
            let keys: Vec<EntityKey> = matching(&state, &stmt.entity, &joins, stmt.filter.as_ref())?
                .into_iter()
                .map(|(k, _)| k.clone())
                .collect();
            conn.lock_for_write(&mut state, table, &keys)?;
            for key in &keys {
                let prior = state.table(table).rows.remove(key);
                conn.record_undo(Undo::Row {
                    table,
                    key: key.clone(),
                    prior,
                });
            }
            Ok(keys.len() as u64)
        })();
        observed("bulk_delete", table, start, result, |n| *n as usize)
    }
}
